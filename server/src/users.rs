use anyhow::Result;
use tracing::{debug, info, warn};
use validator::Validate;

use accounts_types::{CreateUser, ListUsersQuery, Login, Token, UpdateUser, User, UserPage};

use crate::auth::{self, AuthError, TokenManager};
use crate::db::{self, UserStoreError};
use crate::error::AppError;

/// Account operations shared by the HTTP handlers. Validates input, hashes
/// passwords off the runtime and delegates storage to the configured store.
#[derive(Debug, Clone)]
pub struct UserService {
    db: db::DynUserStorer,
    tokens: TokenManager,
}

impl UserService {
    pub fn new(db: db::DynUserStorer, tokens: TokenManager) -> Self {
        Self { db, tokens }
    }

    pub async fn create_user(&self, payload: CreateUser) -> Result<User, AppError> {
        payload.validate()?;

        let CreateUser {
            name,
            email,
            password,
        } = payload;
        let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
            .await
            .map_err(|e| AuthError::PasswordHash(e.to_string()))??;

        let user = self
            .db
            .create_user(User::new(name, email), password_hash)
            .await?;
        info!(user_id = user.id, "created user");
        Ok(user)
    }

    /// Every failure short of a store outage is reported as invalid
    /// credentials so callers cannot probe for registered emails.
    pub async fn authenticate(&self, payload: Login) -> Result<Token, AppError> {
        if payload.validate().is_err() {
            return Err(AppError::InvalidCredentials);
        }

        let stored = match self.db.get_user_by_email(payload.email).await {
            Ok(stored) => stored,
            Err(UserStoreError::EmailNotFound { email }) => {
                debug!(email = email, "login for unknown email");
                return Err(AppError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        let password = payload.password;
        let hash = stored.password_hash;
        let matches = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
            .await
            .unwrap_or(false);
        if !matches {
            warn!(user_id = stored.user.id, "login with wrong password");
            return Err(AppError::InvalidCredentials);
        }

        let token = self.tokens.issue(&stored.user)?;
        info!(user_id = stored.user.id, "user logged in");
        Ok(token)
    }

    pub async fn get_user(&self, id: String) -> Result<User, AppError> {
        Ok(self.db.get_user(id).await?)
    }

    pub async fn list_users(&self, query: ListUsersQuery) -> Result<UserPage, AppError> {
        let (page, limit) = (query.page(), query.limit());
        let (users, total) = self.db.get_users(query.offset(), limit).await?;
        Ok(UserPage {
            users,
            total,
            page,
            limit,
        })
    }

    pub async fn update_user(&self, id: String, payload: UpdateUser) -> Result<User, AppError> {
        if payload.is_empty() {
            return Err(UserStoreError::NoFieldsToUpdate.into());
        }
        payload.validate()?;

        let user = self.db.update_user(id, payload).await?;
        info!(user_id = user.id, "updated user");
        Ok(user)
    }

    pub async fn delete_user(&self, id: String) -> Result<(), AppError> {
        self.db.delete_user(id.clone()).await?;
        info!(user_id = id, "deleted user");
        Ok(())
    }

    pub async fn count_users(&self) -> Result<i64, AppError> {
        Ok(self.db.count_users().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemory;
    use std::sync::Arc;
    use std::time::Duration;

    fn service() -> UserService {
        UserService::new(
            Arc::new(InMemory::new()),
            TokenManager::new("test-secret", Duration::from_secs(3600)),
        )
    }

    fn create_payload(name: &str, email: &str) -> CreateUser {
        CreateUser {
            name: name.to_string(),
            email: email.to_string(),
            password: "pas$worD123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_user() {
        let service = service();
        let user = service
            .create_user(create_payload("Jimmy", "jimmy@example.com"))
            .await
            .unwrap();

        assert_eq!(user.name, "Jimmy");
        assert_eq!(user.email, "jimmy@example.com");
        assert_eq!(service.count_users().await.unwrap(), 1);

        let stored = service
            .db
            .get_user_by_email("jimmy@example.com".to_string())
            .await
            .unwrap();
        assert_ne!(stored.password_hash, "pas$worD123");
        assert!(auth::verify_password("pas$worD123", &stored.password_hash));
    }

    #[tokio::test]
    async fn test_create_user_invalid_payload() {
        let service = service();
        let mut payload = create_payload("Jimmy", "jimmy@example.com");
        payload.password = "weak".to_string();

        let err = service.create_user(payload).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(service.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_user_duplicate_email() {
        let service = service();
        service
            .create_user(create_payload("Jimmy", "jimmy@example.com"))
            .await
            .unwrap();

        let err = service
            .create_user(create_payload("James", "jimmy@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::UserStore(UserStoreError::EmailExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let service = service();
        let user = service
            .create_user(create_payload("Jimmy", "jimmy@example.com"))
            .await
            .unwrap();

        let token = service
            .authenticate(Login {
                email: "jimmy@example.com".to_string(),
                password: "pas$worD123".to_string(),
            })
            .await
            .unwrap();
        let claims = service.tokens.verify(&token.token).unwrap();
        assert_eq!(claims.sub, user.id);
    }

    #[tokio::test]
    async fn test_authenticate_failures_are_uniform() {
        let service = service();
        service
            .create_user(create_payload("Jimmy", "jimmy@example.com"))
            .await
            .unwrap();

        for (email, password) in [
            ("jimmy@example.com", "wrong$Passw0rd"),
            ("nobody@example.com", "pas$worD123"),
            ("not-an-email", "pas$worD123"),
            ("jimmy@example.com", ""),
        ] {
            let err = service
                .authenticate(Login {
                    email: email.to_string(),
                    password: password.to_string(),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidCredentials), "{email}");
        }
    }

    #[tokio::test]
    async fn test_list_users_pages() {
        let service = service();
        for i in 0..15 {
            service
                .create_user(create_payload("User", &format!("user{i}@example.com")))
                .await
                .unwrap();
        }

        let page = service.list_users(ListUsersQuery::new()).await.unwrap();
        assert_eq!(page.total, 15);
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 10);
        assert_eq!(page.users.len(), 10);
        assert_eq!(page.users[0].email, "user14@example.com");

        let page = service
            .list_users(ListUsersQuery::new().with_page(2).with_limit(10))
            .await
            .unwrap();
        assert_eq!(page.users.len(), 5);
        assert_eq!(page.users[4].email, "user0@example.com");

        let page = service
            .list_users(ListUsersQuery::new().with_page(-3).with_limit(500))
            .await
            .unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 10);
    }

    #[tokio::test]
    async fn test_update_user() {
        let service = service();
        let user = service
            .create_user(create_payload("Jimmy", "jimmy@example.com"))
            .await
            .unwrap();

        let err = service
            .update_user(user.id.clone(), UpdateUser::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::UserStore(UserStoreError::NoFieldsToUpdate)
        ));

        let err = service
            .update_user(
                user.id.clone(),
                UpdateUser {
                    name: None,
                    email: Some("broken".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let updated = service
            .update_user(
                user.id.clone(),
                UpdateUser {
                    name: Some("James".to_string()),
                    email: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "James");
        assert_eq!(service.get_user(user.id).await.unwrap().name, "James");
    }

    #[tokio::test]
    async fn test_delete_user() {
        let service = service();
        let user = service
            .create_user(create_payload("Jimmy", "jimmy@example.com"))
            .await
            .unwrap();

        service.delete_user(user.id.clone()).await.unwrap();
        let err = service.get_user(user.id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::UserStore(UserStoreError::NotFound { .. })
        ));
    }
}
