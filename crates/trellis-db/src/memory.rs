//! In-process storage backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use trellis_common::Jid;
use trellis_common::config::HostConfig;

use crate::password::hash_password;
use crate::storage::{OfflineMessage, Storage, StorageBackend, StorageError, User};

/// Accounts and offline messages held in memory. Lost on restart.
#[derive(Default)]
pub struct MemoryStorage {
    users: RwLock<HashMap<Jid, User>>,
    messages: RwLock<Vec<OfflineMessage>>,
    next_id: AtomicI64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `password` and store a new account.
    pub async fn create_user(&self, jid: &Jid, password: &str) -> Result<User, StorageError> {
        let password = password.to_owned();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))??;
        let user = User::new(jid, Some(hash));
        self.save_user(&user).await?;
        Ok(user)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find_user(&self, jid: &Jid) -> Result<Option<User>, StorageError> {
        Ok(self.users.read().await.get(&jid.bare()).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<(), StorageError> {
        self.users.write().await.insert(user.jid.bare(), user.clone());
        Ok(())
    }

    async fn save_message(&self, from: &Jid, to: &Jid, body: &str) -> Result<(), StorageError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.messages.write().await.push(OfflineMessage {
            id,
            from: from.clone(),
            to: to.bare(),
            body: body.to_owned(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn find_messages(&self, jid: &Jid) -> Result<Vec<OfflineMessage>, StorageError> {
        let bare = jid.bare();
        Ok(self.messages.read().await.iter().filter(|m| m.to == bare).cloned().collect())
    }

    async fn destroy_message(&self, id: i64) -> Result<(), StorageError> {
        self.messages.write().await.retain(|m| m.id != id);
        Ok(())
    }
}

/// Registry entry for `storage = "memory"`.
pub struct MemoryBackend;

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open(&self, _host: &HostConfig) -> Result<Arc<dyn Storage>, StorageError> {
        Ok(Arc::new(MemoryStorage::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_messages_round_trip_in_order() {
        let storage = MemoryStorage::new();
        let alice = Jid::parse("alice@a.example/tea").unwrap();
        let bob = Jid::parse("bob@a.example/phone").unwrap();
        storage.save_message(&alice, &bob, "first").await.unwrap();
        storage.save_message(&alice, &bob, "second").await.unwrap();

        let msgs = storage.find_messages(&bob.bare()).await.unwrap();
        assert_eq!(msgs.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), ["first", "second"]);
        assert_eq!(msgs[0].to, bob.bare());

        storage.destroy_message(msgs[0].id).await.unwrap();
        assert_eq!(storage.find_messages(&bob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn users_are_keyed_by_bare_address() {
        let storage = MemoryStorage::new();
        let alice = Jid::parse("alice@a.example").unwrap();
        storage.save_user(&User::new(&alice, None)).await.unwrap();
        let full = Jid::parse("Alice@A.example/laptop").unwrap();
        assert_eq!(storage.find_user(&full).await.unwrap().unwrap().jid, alice);
    }
}
