//! The storage contract and the backend registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trellis_common::Jid;
use trellis_common::config::HostConfig;

use crate::password::verify_password_deferred;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend '{0}' is not registered")]
    UnknownBackend(String),

    #[error("storage backend misconfigured: {0}")]
    Config(String),

    #[error("password hash error: {0}")]
    Hash(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Backend(String),
}

/// An account known to storage. `jid` is always bare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub jid: Jid,
    /// Argon2 PHC string; `None` disables password login.
    pub password_hash: Option<String>,
}

impl User {
    pub fn new(jid: &Jid, password_hash: Option<String>) -> Self {
        Self { jid: jid.bare(), password_hash }
    }
}

/// A message stored for an account with no connected resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineMessage {
    pub id: i64,
    pub from: Jid,
    pub to: Jid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent account and message storage for one or more virtual hosts.
///
/// Every method may be called concurrently from many session tasks, for
/// different or identical accounts. Implementations must convert full
/// addresses to bare ones before lookups.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Validate a username/password pair. Returns the account on success.
    async fn authenticate(&self, jid: &Jid, password: &str) -> Result<Option<User>, StorageError> {
        if password.is_empty() {
            return Ok(None);
        }
        let Some(user) = self.find_user(jid).await? else {
            return Ok(None);
        };
        let Some(hash) = user.password_hash.as_deref() else {
            return Ok(None);
        };
        // A corrupt stored hash is a failed login, not a storage fault.
        let valid = verify_password_deferred(password, hash).await.unwrap_or(false);
        Ok(valid.then_some(user))
    }

    async fn find_user(&self, jid: &Jid) -> Result<Option<User>, StorageError>;

    async fn save_user(&self, user: &User) -> Result<(), StorageError>;

    async fn save_message(&self, from: &Jid, to: &Jid, body: &str) -> Result<(), StorageError>;

    /// Offline messages addressed to the bare form of `jid`, oldest first.
    async fn find_messages(&self, jid: &Jid) -> Result<Vec<OfflineMessage>, StorageError>;

    async fn destroy_message(&self, id: i64) -> Result<(), StorageError>;
}

/// Opens a [`Storage`] for one virtual host's configuration.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn open(&self, host: &HostConfig) -> Result<Arc<dyn Storage>, StorageError>;
}

/// Storage backends by configuration name. Built once at process start and
/// passed to whatever needs to open storage; there is no global lookup.
pub struct StorageRegistry {
    backends: HashMap<String, Box<dyn StorageBackend>>,
}

impl StorageRegistry {
    pub fn empty() -> Self {
        Self { backends: HashMap::new() }
    }

    /// Registry with the built-in `memory` and `sql` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", crate::memory::MemoryBackend);
        registry.register("sql", crate::sql::SqlBackend);
        registry
    }

    pub fn register(&mut self, name: &str, backend: impl StorageBackend + 'static) {
        self.backends.insert(name.to_owned(), Box::new(backend));
    }

    pub async fn open(&self, host: &HostConfig) -> Result<Arc<dyn Storage>, StorageError> {
        let backend = self
            .backends
            .get(&host.storage)
            .ok_or_else(|| StorageError::UnknownBackend(host.storage.clone()))?;
        backend.open(host).await
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
