use tokio_postgres::Row;

use accounts_types::User;

use crate::db::{StoredUser, UserStoreError};

pub const USER_COLUMNS: &str = "id, name, email, password_hash, created_at";

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl UserRow {
    pub fn from_row(row: &Row) -> Result<Self, UserStoreError> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            email: row.email,
            created_at: row.created_at,
        }
    }
}

impl From<UserRow> for StoredUser {
    fn from(row: UserRow) -> Self {
        let password_hash = row.password_hash.clone();
        Self {
            user: row.into(),
            password_hash,
        }
    }
}
