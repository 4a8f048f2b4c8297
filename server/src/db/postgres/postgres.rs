use anyhow::Result;
use bb8::{Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager;
use refinery::embed_migrations;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, error, trace, warn};

use crate::shutdown::Deadline;

embed_migrations!("./src/db/postgres/migrations");

const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum PostgresError {
    #[error(transparent)]
    Database(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("connection pool is closed")]
    Closed,

    #[error("connections still checked out at deadline")]
    DrainTimeout,
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
    closed: Arc<AtomicBool>,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self, PostgresError> {
        let config: PgConfig = database_url
            .parse()
            .map_err(|e| PostgresError::Pool(format!("invalid config: {}", e)))?;

        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .build(manager)
            .await
            .map_err(|e| PostgresError::Pool(e.to_string()))?;

        Ok(Self {
            pool,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn migrate(&self) -> Result<(), PostgresError> {
        trace!("start run migrations");
        let mut client = self.get_client().await?;

        let runner = migrations::runner();

        for migration in runner.get_migrations() {
            debug!(
                name = migration.name(),
                checksum = migration.checksum(),
                "migration checksum",
            );
        }

        runner.run_async(&mut *client).await.map_err(|e| {
            error!(error = ?e, "fail migration");
            PostgresError::Pool(format!("migration failed: {}", e))
        })?;

        debug!("finish run migrations");
        Ok(())
    }

    pub async fn get_client(
        &self,
    ) -> Result<PooledConnection<'_, PostgresConnectionManager<NoTls>>, PostgresError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PostgresError::Closed);
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PostgresError::Pool(e.to_string()))?;
        // close may have seen an empty pool while this checkout was pending
        if self.closed.load(Ordering::SeqCst) {
            return Err(PostgresError::Closed);
        }
        Ok(client)
    }

    /// Stop handing out connections, then wait until every checked out
    /// connection has been returned to the pool or the deadline passes.
    ///
    /// Idle connections stay open in the pool; they are released once the
    /// last clone of the store is dropped.
    pub async fn close(&self, deadline: Deadline) -> Result<(), PostgresError> {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let state = self.pool.state();
            let in_use = state.connections.saturating_sub(state.idle_connections);
            if in_use == 0 {
                debug!(connections = state.connections, "postgres pool drained");
                return Ok(());
            }
            if deadline.is_expired() {
                warn!(in_use = in_use, "postgres pool not drained at deadline");
                return Err(PostgresError::DrainTimeout);
            }
            trace!(in_use = in_use, "waiting for postgres connections");
            tokio::time::sleep(DRAIN_POLL.min(deadline.remaining())).await;
        }
    }
}
