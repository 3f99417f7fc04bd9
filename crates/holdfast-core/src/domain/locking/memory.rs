//! In-memory lock store
//!
//! Single-process only. Every mutation happens under one write lock, so
//! `insert_if_absent` is atomic for all tasks sharing the store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

use super::store::{InsertOutcome, LockStore};
use super::types::{Lock, lock_key};

/// Lock store backed by a map keyed by `resource_type:resource_id`
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    locks: RwLock<HashMap<String, Lock>>,
}

impl InMemoryLockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    /// Whether the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn get_lock(&self, resource_type: &str, resource_id: &str) -> Result<Option<Lock>> {
        let locks = self.locks.read().await;
        Ok(locks.get(&lock_key(resource_type, resource_id)).cloned())
    }

    async fn find_lock(&self, lock_id: Uuid) -> Result<Option<Lock>> {
        let locks = self.locks.read().await;
        Ok(locks.values().find(|lock| lock.lock_id == lock_id).cloned())
    }

    async fn insert_if_absent(&self, lock: &Lock) -> Result<InsertOutcome> {
        let mut locks = self.locks.write().await;
        let key = lock.lock_key();

        if let Some(existing) = locks.get(&key) {
            if existing.is_active() {
                return Ok(InsertOutcome::Occupied(existing.clone()));
            }
            debug!(lock_key = %key, "Replacing expired lock");
        }

        locks.insert(key, lock.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn replace_lock(&self, lock: &Lock) -> Result<bool> {
        let mut locks = self.locks.write().await;
        match locks.get_mut(&lock.lock_key()) {
            Some(current) if current.lock_id == lock.lock_id && current.is_active() => {
                *current = lock.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lock(&self, lock_id: Uuid) -> Result<bool> {
        let mut locks = self.locks.write().await;
        let key = locks
            .iter()
            .find(|(_, lock)| lock.lock_id == lock_id)
            .map(|(k, _)| k.clone());

        Ok(key.and_then(|k| locks.remove(&k)).is_some())
    }

    async fn cleanup_expired_locks(&self) -> Result<usize> {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| lock.is_active());
        Ok(before - locks.len())
    }

    async fn get_user_locks(&self, owner_id: &str) -> Result<Vec<Lock>> {
        let locks = self.locks.read().await;
        Ok(locks
            .values()
            .filter(|lock| lock.is_owned_by(owner_id) && lock.is_active())
            .cloned()
            .collect())
    }

    async fn list_locks(&self) -> Result<Vec<Lock>> {
        let locks = self.locks.read().await;
        Ok(locks.values().filter(|lock| lock.is_active()).cloned().collect())
    }
}
