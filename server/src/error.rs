use thiserror::Error;
use validator::ValidationErrors;

use crate::auth;
use crate::db;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("user store error: {0}")]
    UserStore(#[from] db::UserStoreError),
    #[error("auth error: {0}")]
    Auth(#[from] auth::AuthError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationErrors),
    #[error("invalid credentials")]
    InvalidCredentials,
}
