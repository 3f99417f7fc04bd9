//! Pessimistic resource locking
//!
//! Exclusive, time-boxed ownership of a business resource across requests.
//!
//! # Architecture
//!
//! - **Lock**: ownership record keyed by `(resource_type, resource_id)`
//! - **LockStore**: storage trait with an atomic insert-if-absent and a
//!   compare-and-swap replace for renewals
//! - **Stores**: `InMemoryLockStore` (one process), `FileLockStore`
//!   (processes sharing a directory)
//! - **LockManager**: acquire, renew, release, force-release, `with_lock`
//! - **Sweeper**: optional background reaping of expired records
//!
//! # Example
//!
//! ```ignore
//! use holdfast_core::domain::locking::LockManager;
//!
//! let manager = LockManager::in_memory();
//!
//! let total = manager
//!     .with_lock("Order", "42", user_id, user_name, None, |lock| async move {
//!         // Do work on the order...
//!         Ok(recalculate(&lock.resource_id).await?)
//!     })
//!     .await?;
//! ```

pub mod file;
pub mod manager;
pub mod memory;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-export main types
pub use file::FileLockStore;
pub use manager::LockManager;
pub use memory::InMemoryLockStore;
pub use store::{InsertOutcome, LockStore};
pub use sweeper::CleanupTask;
pub use types::{Lock, LockConfig, lock_key};
