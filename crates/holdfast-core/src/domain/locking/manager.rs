//! Lock manager for pessimistic concurrency control
//!
//! The lock manager is the only component that creates, renews or deletes
//! lock records. Per resource key it runs a small state machine:
//! unlocked, locked by one owner (renewable by that owner), unlocked again
//! on release, forced release or expiry.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::memory::InMemoryLockStore;
use super::store::{InsertOutcome, LockStore};
use super::types::{Lock, LockConfig, lock_key};

/// Lock manager for coordinating resource locks
#[derive(Clone)]
pub struct LockManager {
    /// Configuration
    config: LockConfig,

    /// Backing store for lock records
    store: Arc<dyn LockStore>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Create a new lock manager over `store`
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { config, store }
    }

    /// Create a lock manager with an in-memory store and default configuration
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLockStore::new()), LockConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Get the backing store
    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Acquire an exclusive lock on a resource
    ///
    /// Re-acquiring a lock already held by `owner_id` renews it in place.
    /// Fails with `LockConflict` if another owner holds an active lock.
    ///
    /// # Arguments
    /// * `ttl` - How long the lock lives (None = use default)
    pub async fn acquire_lock(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
        owner_name: &str,
        ttl: Option<Duration>,
    ) -> Result<Lock> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let key = lock_key(resource_type, resource_id);

        debug!(
            lock_key = %key,
            owner_id,
            ttl_ms = ttl.as_millis() as u64,
            "Attempting to acquire lock"
        );

        if let Some(existing) = self.store.get_lock(resource_type, resource_id).await? {
            if existing.is_active() {
                if let Some(renewed) = self.renew_or_conflict(existing, owner_id, ttl).await? {
                    return Ok(renewed);
                }
                // The record lapsed or changed hands before the renewal landed
            }
        }

        let lock = Lock::new(resource_type, resource_id, owner_id, owner_name, ttl);
        match self.store.insert_if_absent(&lock).await? {
            InsertOutcome::Inserted => {
                info!(lock_key = %key, lock_id = %lock.lock_id, owner_id, "Lock acquired");
                Ok(lock)
            }
            // Lost a race against another acquirer
            InsertOutcome::Occupied(existing) => {
                let lock_id = existing.lock_id;
                self.renew_or_conflict(existing, owner_id, ttl)
                    .await?
                    .ok_or(Error::LockExpired { lock_id })
            }
        }
    }

    /// Renew `existing` if `owner_id` holds it, otherwise report the conflict
    ///
    /// Returns `None` when the stored record is no longer `existing`.
    async fn renew_or_conflict(
        &self,
        mut existing: Lock,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>> {
        if existing.is_owned_by(owner_id) {
            existing.renew(ttl);
            if !self.store.replace_lock(&existing).await? {
                return Ok(None);
            }
            debug!(
                lock_key = %existing.lock_key(),
                lock_id = %existing.lock_id,
                "Lock re-acquired by owner"
            );
            return Ok(Some(existing));
        }

        warn!(
            lock_key = %existing.lock_key(),
            holder = %existing.owner_id,
            requested_by = owner_id,
            "Lock contention"
        );
        Err(Error::LockConflict {
            entity_id: existing.lock_key(),
            current_lock: Box::new(existing),
        })
    }

    /// Renew a lock's TTL
    ///
    /// Fails with `LockExpired` if the lock lapsed, even when it lapses while
    /// the renewal is in flight and another owner takes the resource.
    pub async fn renew_lock(&self, lock_id: Uuid, ttl: Option<Duration>) -> Result<Lock> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut lock = self
            .store
            .find_lock(lock_id)
            .await?
            .ok_or_else(|| Error::not_found("lock", lock_id.to_string()))?;

        if lock.is_expired() {
            return Err(Error::LockExpired { lock_id });
        }

        lock.renew(ttl);
        if !self.store.replace_lock(&lock).await? {
            return Err(Error::LockExpired { lock_id });
        }

        debug!(lock_key = %lock.lock_key(), ttl_ms = ttl.as_millis() as u64, "Lock renewed");
        Ok(lock)
    }

    /// Release a lock held by `owner_id`
    ///
    /// An expired lock is still removed but reported as `LockExpired`, since
    /// the caller's ownership had already lapsed.
    pub async fn release_lock(&self, lock_id: Uuid, owner_id: &str) -> Result<()> {
        let lock = self
            .store
            .find_lock(lock_id)
            .await?
            .ok_or_else(|| Error::not_found("lock", lock_id.to_string()))?;

        if !lock.is_owned_by(owner_id) {
            return Err(Error::NotLockOwner {
                lock_id,
                owner_id: owner_id.to_string(),
            });
        }

        self.store.delete_lock(lock_id).await?;

        if lock.is_expired() {
            debug!(lock_key = %lock.lock_key(), "Released lock had already expired");
            return Err(Error::LockExpired { lock_id });
        }

        info!(lock_key = %lock.lock_key(), lock_id = %lock_id, owner_id, "Lock released");
        Ok(())
    }

    /// Get the active lock on a resource, if any
    ///
    /// Expired records are reported as absent.
    pub async fn check_lock(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<Lock>> {
        Ok(self
            .store
            .get_lock(resource_type, resource_id)
            .await?
            .filter(Lock::is_active))
    }

    /// Delete a lock regardless of its owner (operator intervention)
    pub async fn force_release_lock(&self, lock_id: Uuid, admin_id: &str) -> Result<bool> {
        let removed = self.store.delete_lock(lock_id).await?;
        warn!(lock_id = %lock_id, admin_id, removed, "Lock force-released");
        Ok(removed)
    }

    /// Run `action` while holding a lock on the resource
    ///
    /// The lock is released on every exit path, including an error or a
    /// panic inside `action`. A failed release is logged and never replaces
    /// the action's own outcome.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
        owner_name: &str,
        ttl: Option<Duration>,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self
            .acquire_lock(resource_type, resource_id, owner_id, owner_name, ttl)
            .await?;
        let lock_id = lock.lock_id;

        let outcome = AssertUnwindSafe(action(lock)).catch_unwind().await;

        if let Err(e) = self.release_lock(lock_id, owner_id).await {
            warn!(
                lock_key = %lock_key(resource_type, resource_id),
                lock_id = %lock_id,
                error = %e,
                "Failed to release lock after action"
            );
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Get the active locks held by an owner
    pub async fn get_user_locks(&self, owner_id: &str) -> Result<Vec<Lock>> {
        self.store.get_user_locks(owner_id).await
    }

    /// List all active locks
    pub async fn list_locks(&self) -> Result<Vec<Lock>> {
        self.store.list_locks().await
    }

    /// Delete expired lock records
    pub async fn cleanup_expired_locks(&self) -> Result<usize> {
        let cleaned = self.store.cleanup_expired_locks().await?;
        if cleaned > 0 {
            info!(cleaned, "Cleaned up expired locks");
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::FileLockStore;
    use tempfile::TempDir;

    const ORDER: &str = "Order";

    fn create_test_manager() -> LockManager {
        LockManager::in_memory()
    }

    /// In-memory store whose renewals land only after `delay`
    struct SlowRenewStore {
        inner: InMemoryLockStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl LockStore for SlowRenewStore {
        async fn get_lock(&self, resource_type: &str, resource_id: &str) -> Result<Option<Lock>> {
            self.inner.get_lock(resource_type, resource_id).await
        }

        async fn find_lock(&self, lock_id: Uuid) -> Result<Option<Lock>> {
            self.inner.find_lock(lock_id).await
        }

        async fn insert_if_absent(&self, lock: &Lock) -> Result<InsertOutcome> {
            self.inner.insert_if_absent(lock).await
        }

        async fn replace_lock(&self, lock: &Lock) -> Result<bool> {
            tokio::time::sleep(self.delay).await;
            self.inner.replace_lock(lock).await
        }

        async fn delete_lock(&self, lock_id: Uuid) -> Result<bool> {
            self.inner.delete_lock(lock_id).await
        }

        async fn cleanup_expired_locks(&self) -> Result<usize> {
            self.inner.cleanup_expired_locks().await
        }

        async fn get_user_locks(&self, owner_id: &str) -> Result<Vec<Lock>> {
            self.inner.get_user_locks(owner_id).await
        }

        async fn list_locks(&self) -> Result<Vec<Lock>> {
            self.inner.list_locks().await
        }
    }

    fn slow_renew_manager() -> LockManager {
        let store = SlowRenewStore {
            inner: InMemoryLockStore::new(),
            delay: Duration::from_millis(80),
        };
        LockManager::new(Arc::new(store), LockConfig::default())
    }

    #[tokio::test]
    async fn test_acquire_and_release_lock() {
        let manager = create_test_manager();

        let lock = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", None)
            .await
            .expect("Failed to acquire lock");
        assert!(lock.is_active());

        let held = manager.check_lock(ORDER, "42").await.unwrap().unwrap();
        assert_eq!(held.lock_id, lock.lock_id);

        manager.release_lock(lock.lock_id, "alice").await.unwrap();
        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_ttl_comes_from_config() {
        let manager = LockManager::new(
            Arc::new(InMemoryLockStore::new()),
            LockConfig::default().with_ttl(Duration::from_secs(30)),
        );

        let lock = manager.acquire_lock(ORDER, "42", "alice", "Alice", None).await.unwrap();
        assert!(lock.remaining() <= Duration::from_secs(30));
        assert!(lock.remaining() > Duration::from_secs(25));
    }

    #[tokio::test]
    async fn test_other_owner_gets_conflict() {
        let manager = create_test_manager();
        let alice = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let err = manager
            .acquire_lock(ORDER, "42", "bob", "Bob", None)
            .await
            .unwrap_err();

        match err {
            Error::LockConflict { entity_id, current_lock } => {
                assert_eq!(entity_id, "Order:42");
                assert_eq!(current_lock.lock_id, alice.lock_id);
                assert_eq!(current_lock.owner_name, "Alice");
            }
            other => panic!("expected LockConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_becomes_available_after_expiry() {
        let manager = create_test_manager();
        manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let bob = manager
            .acquire_lock(ORDER, "42", "bob", "Bob", None)
            .await
            .expect("expired lock should not block");
        assert_eq!(bob.owner_id, "bob");
    }

    #[tokio::test]
    async fn test_reacquire_renews_same_record() {
        let manager = create_test_manager();

        let first = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let second = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_secs(600)))
            .await
            .unwrap();

        assert_eq!(first.lock_id, second.lock_id);
        assert_eq!(second.renewal_count, 1);
        assert!(second.expires_at > first.expires_at);
        assert_eq!(manager.list_locks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_lock_is_immediately_absent() {
        let manager = create_test_manager();
        manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::ZERO))
            .await
            .unwrap();

        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_lock() {
        let manager = create_test_manager();
        let lock = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_secs(1)))
            .await
            .unwrap();

        let renewed = manager
            .renew_lock(lock.lock_id, Some(Duration::from_secs(600)))
            .await
            .expect("Failed to renew lock");

        assert!(renewed.expires_at > lock.expires_at);
        assert_eq!(renewed.renewal_count, 1);

        let stored = manager.check_lock(ORDER, "42").await.unwrap().unwrap();
        assert_eq!(stored.expires_at, renewed.expires_at);
    }

    #[tokio::test]
    async fn test_renew_expired_lock_fails() {
        let manager = create_test_manager();
        let lock = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::ZERO))
            .await
            .unwrap();

        let err = manager.renew_lock(lock.lock_id, None).await.unwrap_err();
        assert!(matches!(err, Error::LockExpired { lock_id } if lock_id == lock.lock_id));
    }

    #[tokio::test]
    async fn test_renew_unknown_lock_is_not_found() {
        let manager = create_test_manager();
        let err = manager.renew_lock(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "lock", .. }));
    }

    #[tokio::test]
    async fn test_renew_landing_after_expiry_does_not_steal_lock() {
        let manager = slow_renew_manager();
        let alice = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_millis(40)))
            .await
            .unwrap();

        let renewer = manager.clone();
        let renewal = tokio::spawn(async move {
            renewer
                .renew_lock(alice.lock_id, Some(Duration::from_secs(60)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let bob = manager
            .acquire_lock(ORDER, "42", "bob", "Bob", Some(Duration::from_secs(60)))
            .await
            .expect("expired lock should not block");

        let err = renewal.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::LockExpired { lock_id } if lock_id == alice.lock_id));

        let held = manager.check_lock(ORDER, "42").await.unwrap().unwrap();
        assert_eq!(held.lock_id, bob.lock_id);
        assert_eq!(held.owner_id, "bob");
        manager.release_lock(bob.lock_id, "bob").await.unwrap();
    }

    #[tokio::test]
    async fn test_reacquire_landing_after_expiry_reports_new_holder() {
        let manager = slow_renew_manager();
        manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_millis(40)))
            .await
            .unwrap();

        let again = manager.clone();
        let reacquire = tokio::spawn(async move {
            again
                .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::from_secs(60)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let bob = manager
            .acquire_lock(ORDER, "42", "bob", "Bob", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        match reacquire.await.unwrap().unwrap_err() {
            Error::LockConflict { current_lock, .. } => {
                assert_eq!(current_lock.lock_id, bob.lock_id);
            }
            other => panic!("expected LockConflict, got {:?}", other),
        }
        assert_eq!(manager.list_locks().await.unwrap(), vec![bob]);
    }

    #[tokio::test]
    async fn test_locks_on_lookalike_keys_do_not_conflict() {
        let manager = create_test_manager();
        manager
            .acquire_lock("Order:a", "b", "alice", "Alice", None)
            .await
            .unwrap();

        let bob = manager
            .acquire_lock(ORDER, "a:b", "bob", "Bob", None)
            .await
            .expect("distinct resources must not share a lock");
        assert_eq!(bob.owner_id, "bob");

        let held = manager.check_lock("Order:a", "b").await.unwrap().unwrap();
        assert_eq!(held.owner_id, "alice");
        assert_eq!(manager.list_locks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let manager = create_test_manager();
        let lock = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", None)
            .await
            .unwrap();

        let err = manager.release_lock(lock.lock_id, "bob").await.unwrap_err();
        assert!(matches!(err, Error::NotLockOwner { .. }));
        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_some());

        let err = manager.release_lock(Uuid::new_v4(), "alice").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_release_expired_lock_reports_expiry_and_removes_record() {
        let store = Arc::new(InMemoryLockStore::new());
        let manager = LockManager::new(store.clone(), LockConfig::default());
        let lock = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", Some(Duration::ZERO))
            .await
            .unwrap();

        let err = manager.release_lock(lock.lock_id, "alice").await.unwrap_err();
        assert!(matches!(err, Error::LockExpired { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_force_release_bypasses_ownership() {
        let manager = create_test_manager();
        let lock = manager
            .acquire_lock(ORDER, "42", "alice", "Alice", None)
            .await
            .unwrap();

        assert!(manager.force_release_lock(lock.lock_id, "admin-1").await.unwrap());
        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_none());
        assert!(!manager.force_release_lock(lock.lock_id, "admin-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_success() {
        let manager = create_test_manager();

        let value = manager
            .with_lock(ORDER, "42", "alice", "Alice", None, |lock| async move {
                assert_eq!(lock.owner_id, "alice");
                Ok(lock.resource_id.len())
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_error() {
        let manager = create_test_manager();

        let err = manager
            .with_lock(ORDER, "42", "alice", "Alice", None, |_lock| async move {
                Err::<(), _>(Error::Domain(anyhow::anyhow!("payment declined")))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "payment declined");
        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_panic() {
        let manager = create_test_manager();
        let inner = manager.clone();

        let joined = tokio::spawn(async move {
            inner
                .with_lock(ORDER, "42", "alice", "Alice", None, |_lock| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_conflict_skips_action() {
        let manager = create_test_manager();
        manager
            .acquire_lock(ORDER, "42", "alice", "Alice", None)
            .await
            .unwrap();

        let mut ran = false;
        let err = manager
            .with_lock(ORDER, "42", "bob", "Bob", None, |_lock| {
                ran = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::LockConflict { .. }));
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_with_lock_keeps_result_when_release_fails() {
        let manager = create_test_manager();
        let admin = manager.clone();

        let value = manager
            .with_lock(ORDER, "42", "alice", "Alice", None, |lock| async move {
                admin.force_release_lock(lock.lock_id, "admin-1").await?;
                Ok::<_, Error>("done")
            })
            .await
            .expect("release failure must not replace the result");

        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_user_locks_and_cleanup() {
        let manager = create_test_manager();
        manager.acquire_lock(ORDER, "1", "alice", "Alice", None).await.unwrap();
        manager.acquire_lock(ORDER, "2", "alice", "Alice", None).await.unwrap();
        manager
            .acquire_lock(ORDER, "3", "alice", "Alice", Some(Duration::ZERO))
            .await
            .unwrap();
        manager.acquire_lock(ORDER, "4", "bob", "Bob", None).await.unwrap();

        assert_eq!(manager.get_user_locks("alice").await.unwrap().len(), 2);
        assert_eq!(manager.get_user_locks("bob").await.unwrap().len(), 1);
        assert_eq!(manager.cleanup_expired_locks().await.unwrap(), 1);
        assert_eq!(manager.list_locks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_single_winner() {
        let manager = create_test_manager();

        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let owner = format!("owner-{}", i);
                manager.acquire_lock(ORDER, "42", &owner, &owner, None).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(Error::LockConflict { .. }) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_manager_over_file_store() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = LockConfig::default().with_lock_dir(temp_dir.path().join("locks"));
        let store = FileLockStore::open(config.lock_dir.clone()).await.unwrap();
        let manager = LockManager::new(Arc::new(store), config);

        let lock = manager.acquire_lock(ORDER, "42", "alice", "Alice", None).await.unwrap();

        let second = LockManager::new(
            Arc::new(FileLockStore::new(temp_dir.path().join("locks"))),
            LockConfig::default(),
        );
        let err = second
            .acquire_lock(ORDER, "42", "bob", "Bob", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));

        second.release_lock(lock.lock_id, "alice").await.unwrap();
        assert!(manager.check_lock(ORDER, "42").await.unwrap().is_none());
    }
}
