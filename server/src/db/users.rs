use anyhow::Result;
use async_trait::async_trait;
use std::{fmt::Debug, sync::Arc};
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

use accounts_types::{UpdateUser, User};

use crate::db::postgres::PostgresError;
use crate::shutdown::{Deadline, StopError, Stoppable};

#[derive(Error, Debug)]
pub enum UserStoreError {
    #[error("user not found, id: {id}")]
    NotFound { id: String },

    #[error("user not found, email: {email}")]
    EmailNotFound { email: String },

    #[error("invalid user id: {id}")]
    InvalidId { id: String },

    #[error("user with email {email} already exists")]
    EmailExists { email: String },

    #[error("no fields to update")]
    NoFieldsToUpdate,

    #[error("user store is closed")]
    Closed,

    #[error("user store disconnect deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Postgres(PostgresError),

    #[error(transparent)]
    Database(#[from] tokio_postgres::Error),
}

impl From<PostgresError> for UserStoreError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Closed => Self::Closed,
            PostgresError::DrainTimeout => Self::DeadlineExceeded,
            other => Self::Postgres(other),
        }
    }
}

/// User record together with its password hash. Only the login path reads
/// the hash, everything else works with plain [`User`].
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user: User,
    pub password_hash: String,
}

#[async_trait]
pub trait UserStorer: Sync + Send + Debug {
    async fn create_user(&self, user: User, password_hash: String)
        -> Result<User, UserStoreError>;
    async fn get_user(&self, id: String) -> Result<User, UserStoreError>;
    async fn get_user_by_email(&self, email: String) -> Result<StoredUser, UserStoreError>;
    /// Newest first, along with the total number of users.
    async fn get_users(&self, offset: i64, limit: i64)
        -> Result<(Vec<User>, i64), UserStoreError>;
    async fn update_user(&self, id: String, update: UpdateUser) -> Result<User, UserStoreError>;
    async fn delete_user(&self, id: String) -> Result<(), UserStoreError>;
    async fn count_users(&self) -> Result<i64, UserStoreError>;
    /// Refuse new operations and wait for in flight ones until the deadline.
    async fn disconnect(&self, deadline: Deadline) -> Result<(), UserStoreError>;
}

pub type DynUserStorer = Arc<dyn UserStorer>;

pub fn parse_id(id: &str) -> Result<Ulid, UserStoreError> {
    Ulid::from_string(id).map_err(|_| UserStoreError::InvalidId { id: id.to_string() })
}

/// Store handle registered with the shutdown coordinator as the connection
/// resource. It is stopped concurrently with every other service, so in
/// flight requests may still see `UserStoreError::Closed` during shutdown.
#[derive(Debug, Clone)]
pub struct StoreConnection {
    db: DynUserStorer,
}

impl StoreConnection {
    pub fn new(db: DynUserStorer) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Stoppable for StoreConnection {
    fn name(&self) -> &str {
        "user-store"
    }

    async fn stop(&self, deadline: Deadline) -> Result<(), StopError> {
        debug!("disconnect user store");
        match self.db.disconnect(deadline).await {
            Ok(()) => Ok(()),
            Err(UserStoreError::DeadlineExceeded) => Err(StopError::DeadlineExceeded),
            Err(e) => Err(StopError::Other(e.into())),
        }
    }
}
