//! Storage trait for lock records
//!
//! The lock manager only talks to this trait, so a shared backend (a
//! relational table with a unique key, a key-value store with `SETNX`) can
//! replace the bundled stores without touching the manager.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

use super::types::Lock;

/// Result of an atomic insert attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The lock was stored; the key was empty or held an expired record
    Inserted,
    /// An active lock already occupies the key
    Occupied(Lock),
}

/// Storage backend for lock records
///
/// Records returned by `get_lock` and `find_lock` may be expired; deciding
/// what an expired record means is the manager's job. `insert_if_absent` is
/// and `replace_lock` must be atomic: two concurrent callers on the same key
/// must never both see `Inserted` while the first record is active, and a
/// renewal must never overwrite a record that another owner has since taken.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Get the record stored for a resource, if any
    async fn get_lock(&self, resource_type: &str, resource_id: &str) -> Result<Option<Lock>>;

    /// Get a record by lock ID
    async fn find_lock(&self, lock_id: Uuid) -> Result<Option<Lock>>;

    /// Store `lock` unless an active lock already holds its key
    async fn insert_if_absent(&self, lock: &Lock) -> Result<InsertOutcome>;

    /// Overwrite the record for `lock`'s key with `lock`
    ///
    /// Succeeds only while the stored record is still active and carries the
    /// same lock ID. Returns false, leaving the store untouched, when the
    /// record expired, was deleted, or was replaced by another lock.
    async fn replace_lock(&self, lock: &Lock) -> Result<bool>;

    /// Delete a record by lock ID, returning whether one was removed
    async fn delete_lock(&self, lock_id: Uuid) -> Result<bool>;

    /// Delete every expired record, returning how many were removed
    async fn cleanup_expired_locks(&self) -> Result<usize>;

    /// Get the active locks held by an owner
    async fn get_user_locks(&self, owner_id: &str) -> Result<Vec<Lock>>;

    /// Get every active lock
    async fn list_locks(&self) -> Result<Vec<Lock>>;
}
