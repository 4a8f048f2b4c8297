use anyhow::Result;
use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tracing::debug;

use super::{
    models::{UserRow, USER_COLUMNS},
    postgres::PostgresStore,
};
use crate::db::{parse_id, StoredUser, UserStoreError, UserStorer};
use crate::shutdown::Deadline;
use accounts_types::{UpdateUser, User};

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

#[async_trait]
impl UserStorer for PostgresStore {
    async fn create_user(
        &self,
        user: User,
        password_hash: String,
    ) -> Result<User, UserStoreError> {
        debug!(id = user.id, email = user.email, "create user postgres");
        let client = self.get_client().await?;

        let sql = format!(
            "INSERT INTO users (id, name, email, password_hash, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {USER_COLUMNS}"
        );
        let row = client
            .query_one(
                sql.as_str(),
                &[
                    &user.id,
                    &user.name,
                    &user.email,
                    &password_hash,
                    &user.created_at,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    UserStoreError::EmailExists {
                        email: user.email.clone(),
                    }
                } else {
                    UserStoreError::Database(e)
                }
            })?;

        Ok(UserRow::from_row(&row)?.into())
    }

    async fn get_user(&self, id: String) -> Result<User, UserStoreError> {
        parse_id(&id)?;
        let client = self.get_client().await?;

        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = client
            .query_opt(sql.as_str(), &[&id])
            .await?
            .ok_or_else(|| UserStoreError::NotFound { id: id.clone() })?;

        Ok(UserRow::from_row(&row)?.into())
    }

    async fn get_user_by_email(&self, email: String) -> Result<StoredUser, UserStoreError> {
        let client = self.get_client().await?;

        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = client
            .query_opt(sql.as_str(), &[&email])
            .await?
            .ok_or_else(|| UserStoreError::EmailNotFound {
                email: email.clone(),
            })?;

        Ok(UserRow::from_row(&row)?.into())
    }

    async fn get_users(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), UserStoreError> {
        let client = self.get_client().await?;

        let total: i64 = client
            .query_one("SELECT COUNT(*) FROM users", &[])
            .await?
            .try_get(0)?;

        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users
             ORDER BY created_at DESC, id DESC
             LIMIT $1 OFFSET $2"
        );
        let rows = client.query(sql.as_str(), &[&limit, &offset]).await?;

        let users = rows
            .iter()
            .map(|row| UserRow::from_row(row).map(User::from))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((users, total))
    }

    async fn update_user(&self, id: String, update: UpdateUser) -> Result<User, UserStoreError> {
        debug!(id = id, "update user postgres");
        parse_id(&id)?;
        if update.is_empty() {
            return Err(UserStoreError::NoFieldsToUpdate);
        }
        let client = self.get_client().await?;

        let mut sets: Vec<String> = vec![];
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![];
        let mut param_idx = 1;

        if let Some(ref name) = update.name {
            sets.push(format!("name = ${}", param_idx));
            params.push(name);
            param_idx += 1;
        }

        if let Some(ref email) = update.email {
            sets.push(format!("email = ${}", param_idx));
            params.push(email);
            param_idx += 1;
        }

        let sql = format!(
            "UPDATE users SET {}, updated_at = NOW() WHERE id = ${} RETURNING {USER_COLUMNS}",
            sets.join(", "),
            param_idx
        );
        params.push(&id);

        let row = client
            .query_opt(sql.as_str(), &params)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    UserStoreError::EmailExists {
                        email: update.email.clone().unwrap_or_default(),
                    }
                } else {
                    UserStoreError::Database(e)
                }
            })?
            .ok_or_else(|| UserStoreError::NotFound { id: id.clone() })?;

        Ok(UserRow::from_row(&row)?.into())
    }

    async fn delete_user(&self, id: String) -> Result<(), UserStoreError> {
        debug!(id = id, "delete user postgres");
        parse_id(&id)?;
        let client = self.get_client().await?;

        let rows_affected = client
            .execute("DELETE FROM users WHERE id = $1", &[&id])
            .await?;

        if rows_affected == 0 {
            return Err(UserStoreError::NotFound { id });
        }

        Ok(())
    }

    async fn count_users(&self) -> Result<i64, UserStoreError> {
        let client = self.get_client().await?;
        let total: i64 = client
            .query_one("SELECT COUNT(*) FROM users", &[])
            .await?
            .try_get(0)?;
        Ok(total)
    }

    async fn disconnect(&self, deadline: Deadline) -> Result<(), UserStoreError> {
        debug!("disconnect postgres store");
        self.close(deadline).await?;
        Ok(())
    }
}
