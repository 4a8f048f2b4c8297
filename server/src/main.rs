use anyhow::{Context, Error, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod app;
mod auth;
mod config;
mod db;
mod error;
mod metrics;
mod periodic;
mod server;
mod shutdown;
mod users;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// path to the config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    // load config from path
    let config = config::Config::load(args.config)?;

    // init tracing
    let _ = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    // create app
    let app = app::new(config.clone()).await?;

    // start server
    let listener = TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("fail bind {}", config.server.addr))?;
    let server_handle = app.server.start(listener)?;

    let shutdown = shutdown::ShutdownCoordinator::new(
        config.shutdown_timeout(),
        Arc::new(server_handle),
        Arc::new(db::StoreConnection::new(app.db.clone())),
    );

    // periodic user count, cancelled along with everything else on shutdown
    let monitor = Arc::new(app.user_count_monitor(config.monitor_interval())?);
    monitor.start(shutdown.subscribe())?;
    shutdown.register(monitor)?;

    if let Err(e) = shutdown.wait_for_shutdown().await {
        for failure in e.failures() {
            error!(service = failure.service, error = %failure.source, "service failed to stop");
        }
        error!(state = ?shutdown.state(), error = %e, "shutdown completed with errors");
        return Err(e.into());
    }
    info!(state = ?shutdown.state(), "shutdown complete");
    Ok(())
}
