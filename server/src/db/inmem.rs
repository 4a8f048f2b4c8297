use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use accounts_types::{UpdateUser, User};

use crate::db::{self, StoredUser, UserStoreError};
use crate::shutdown::Deadline;

use tracing::debug;

#[derive(Debug, Default)]
struct Users {
    by_id: HashMap<String, StoredUser>,
    // insertion order, oldest first
    order: Vec<String>,
}

#[derive(Debug, Default)]
pub struct InMemory {
    users: RwLock<Users>,
    closed: AtomicBool,
}

impl InMemory {
    pub fn new() -> Self {
        debug!("creating new in-memory user store");
        InMemory::default()
    }

    fn check_open(&self) -> Result<(), UserStoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UserStoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl db::UserStorer for InMemory {
    async fn create_user(
        &self,
        user: User,
        password_hash: String,
    ) -> Result<User, UserStoreError> {
        self.check_open()?;
        debug!(id = user.id, email = user.email, "creating user");

        let mut users = self.users.write().expect("lock not poisoned");
        if users.by_id.values().any(|u| u.user.email == user.email) {
            return Err(UserStoreError::EmailExists { email: user.email });
        }
        users.order.push(user.id.clone());
        users.by_id.insert(
            user.id.clone(),
            StoredUser {
                user: user.clone(),
                password_hash,
            },
        );
        Ok(user)
    }

    async fn get_user(&self, id: String) -> Result<User, UserStoreError> {
        self.check_open()?;
        debug!(id = id, "getting user");
        db::parse_id(&id)?;

        match self.users.read().expect("lock not poisoned").by_id.get(&id) {
            Some(stored) => Ok(stored.user.clone()),
            None => Err(UserStoreError::NotFound { id }),
        }
    }

    async fn get_user_by_email(&self, email: String) -> Result<StoredUser, UserStoreError> {
        self.check_open()?;
        debug!(email = email, "getting user by email");

        let users = self.users.read().expect("lock not poisoned");
        users
            .by_id
            .values()
            .find(|u| u.user.email == email)
            .cloned()
            .ok_or(UserStoreError::EmailNotFound { email })
    }

    async fn get_users(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), UserStoreError> {
        self.check_open()?;
        debug!(offset = offset, limit = limit, "getting users");

        let users = self.users.read().expect("lock not poisoned");
        let total = users.order.len() as i64;
        let page = users
            .order
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .filter_map(|id| users.by_id.get(id))
            .map(|stored| stored.user.clone())
            .collect();
        Ok((page, total))
    }

    async fn update_user(&self, id: String, update: UpdateUser) -> Result<User, UserStoreError> {
        self.check_open()?;
        debug!(id = id, "updating user");
        db::parse_id(&id)?;
        if update.is_empty() {
            return Err(UserStoreError::NoFieldsToUpdate);
        }

        let mut users = self.users.write().expect("lock not poisoned");
        if let Some(ref email) = update.email {
            let taken = users
                .by_id
                .values()
                .any(|u| &u.user.email == email && u.user.id != id);
            if taken {
                return Err(UserStoreError::EmailExists {
                    email: email.clone(),
                });
            }
        }

        let Some(stored) = users.by_id.get_mut(&id) else {
            return Err(UserStoreError::NotFound { id });
        };
        if let Some(name) = update.name {
            stored.user.name = name;
        }
        if let Some(email) = update.email {
            stored.user.email = email;
        }
        Ok(stored.user.clone())
    }

    async fn delete_user(&self, id: String) -> Result<(), UserStoreError> {
        self.check_open()?;
        debug!(id = id, "deleting user");
        db::parse_id(&id)?;

        let mut users = self.users.write().expect("lock not poisoned");
        if users.by_id.remove(&id).is_none() {
            return Err(UserStoreError::NotFound { id });
        }
        users.order.retain(|existing| existing != &id);
        Ok(())
    }

    async fn count_users(&self) -> Result<i64, UserStoreError> {
        self.check_open()?;
        Ok(self.users.read().expect("lock not poisoned").by_id.len() as i64)
    }

    async fn disconnect(&self, _deadline: Deadline) -> Result<(), UserStoreError> {
        debug!("closing in-memory user store");
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
