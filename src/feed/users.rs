use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::core::snowflake::SnowflakeGenerator;
use crate::core::UserId;
use crate::error::{AppError, AppResult};
use crate::feed::models::User;

#[derive(Debug, Default)]
struct RegistryInner {
    users: HashMap<UserId, User>,
    by_username: HashMap<String, UserId>,
}

/// User accounts with unique usernames.
#[derive(Debug)]
pub struct UserRegistry {
    allocator: Arc<SnowflakeGenerator>,
    inner: RwLock<RegistryInner>,
}

impl UserRegistry {
    pub fn new(allocator: Arc<SnowflakeGenerator>) -> Self {
        Self {
            allocator,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub async fn create_user(
        &self,
        username: &str,
        email: Option<String>,
        profile_picture_url: Option<String>,
    ) -> AppResult<User> {
        if username.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "username must not be empty".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        if inner.by_username.contains_key(username) {
            return Err(AppError::InvalidArgument(format!(
                "username '{}' is already taken",
                username
            )));
        }

        let now = Utc::now();
        let user = User {
            user_id: self.allocator.next_id()?,
            username: username.to_string(),
            email,
            profile_picture_url,
            created_at: now,
            updated_at: now,
        };
        inner.by_username.insert(username.to_string(), user.user_id);
        inner.users.insert(user.user_id, user.clone());
        info!(user_id = user.user_id, username, "created user");
        Ok(user)
    }

    pub async fn get(&self, user_id: UserId) -> Option<User> {
        self.inner.read().await.users.get(&user_id).cloned()
    }

    pub async fn get_by_username(&self, username: &str) -> Option<User> {
        let inner = self.inner.read().await;
        let user_id = inner.by_username.get(username)?;
        inner.users.get(user_id).cloned()
    }

    pub async fn contains(&self, user_id: UserId) -> bool {
        self.inner.read().await.users.contains_key(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.users.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.users.is_empty()
    }
}
