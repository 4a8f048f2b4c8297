use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::TokenManager;
use crate::config::Config;
use crate::db;
use crate::metrics;
use crate::periodic::{PeriodicTask, PeriodicTaskError};
use crate::server;
use crate::users::UserService;

pub const USER_COUNT_MONITOR: &str = "user-count-monitor";

#[derive(Debug, Clone)]
pub struct App {
    pub db: db::DynUserStorer,
    pub users: UserService,
    pub metrics: metrics::Metrics,
    pub server: server::Server,
}

// construct a new instance of the accounts application
pub async fn new(config: Config) -> Result<App> {
    debug!(config = ?config, "create new application from config");

    let metrics = metrics::Metrics::new();

    let db: db::DynUserStorer = match config.postgres {
        Some(ref pg) => {
            let pg_store = db::PostgresStore::new(&pg.url)
                .await
                .context("fail create postgres store")?;
            if pg.migrate {
                pg_store.migrate().await.context("fail run migrations")?;
            }
            Arc::new(pg_store)
        }
        None => {
            warn!("no postgres configured, users are kept in memory");
            Arc::new(db::InMemory::new())
        }
    };

    let tokens = TokenManager::new(config.auth.secret.clone(), config.token_ttl());
    let users = UserService::new(db.clone(), tokens.clone());
    let server = server::Server::new(
        config.request_timeout(),
        metrics.clone(),
        users.clone(),
        tokens,
    );

    Ok(App {
        db,
        users,
        metrics,
        server,
    })
}

impl App {
    /// Task that periodically logs the number of registered users and
    /// publishes it as a gauge.
    pub fn user_count_monitor(&self, interval: Duration) -> Result<PeriodicTask, PeriodicTaskError> {
        let users = self.users.clone();
        let metrics = self.metrics.clone();
        PeriodicTask::new(USER_COUNT_MONITOR, interval, move || {
            let users = users.clone();
            let metrics = metrics.clone();
            async move {
                metrics
                    .tasks
                    .periodic_runs_total
                    .get_or_create(&metrics::TaskLabel {
                        task: USER_COUNT_MONITOR.to_string(),
                    })
                    .inc();
                match users.count_users().await {
                    Ok(count) => {
                        metrics.users.users_current.set(count);
                        info!(users = count, "user count");
                    }
                    Err(e) => warn!(error = %e, "fail count users"),
                }
            }
        })
    }
}
