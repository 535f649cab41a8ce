use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::User;

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("Username or email already taken")]
    Conflict,
    #[error("User not found")]
    NotFound,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// User table kept in memory, optionally mirrored to a JSON file after every
/// write.
#[derive(Clone)]
pub struct UserRepository {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
    snapshot: Option<PathBuf>,
}

impl UserRepository {
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            snapshot: None,
        }
    }

    pub fn open(snapshot: PathBuf) -> Result<Self, UserStoreError> {
        let users: Vec<User> = if snapshot.exists() {
            let data = std::fs::read_to_string(&snapshot)?;
            serde_json::from_str(&data)?
        } else {
            Vec::new()
        };
        log::info!("Loaded {} users from {}", users.len(), snapshot.display());
        Ok(Self {
            users: Arc::new(RwLock::new(users.into_iter().map(|u| (u.id, u)).collect())),
            snapshot: Some(snapshot),
        })
    }

    async fn persist(&self, users: &HashMap<Uuid, User>) -> Result<(), UserStoreError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let mut rows: Vec<&User> = users.values().collect();
        rows.sort_by_key(|u| u.created_at);
        let data = serde_json::to_vec_pretty(&rows)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn create_user(&self, user: User) -> Result<User, UserStoreError> {
        let mut users = self.users.write().await;
        let taken = users.values().any(|u| {
            u.username == user.username || u.email.eq_ignore_ascii_case(&user.email)
        });
        if taken {
            return Err(UserStoreError::Conflict);
        }
        users.insert(user.id, user.clone());
        if let Err(e) = self.persist(&users).await {
            users.remove(&user.id);
            return Err(e);
        }
        log::info!("Created user {} ({})", user.username, user.id);
        Ok(user)
    }

    pub async fn get_user_by_id(&self, id: Uuid) -> Option<User> {
        self.users.read().await.get(&id).cloned()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    pub async fn record_login(&self, id: Uuid) -> Result<User, UserStoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(UserStoreError::NotFound)?;
        let previous = user.last_login;
        user.update_last_login();
        let updated = user.clone();
        if let Err(e) = self.persist(&users).await {
            if let Some(user) = users.get_mut(&id) {
                user.last_login = previous;
            }
            return Err(e);
        }
        Ok(updated)
    }
}
