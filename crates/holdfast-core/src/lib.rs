//! Holdfast Core Library
//!
//! Concurrency control for business resources that live across requests:
//!
//! - **Optimistic**: version-stamped resources, guarded writes with retry
//! - **Pessimistic**: time-boxed exclusive locks with pluggable storage
//!
//! Persistence of the resources themselves stays with the host application.

pub mod config;
pub mod domain;
pub mod error;

pub use error::{Error, Result};

/// Commonly used imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::locking::{
        FileLockStore, InMemoryLockStore, Lock, LockConfig, LockManager, LockStore,
    };
    pub use crate::domain::versioning::{
        BatchItem, ResourceRepository, RetryPolicy, VersionGuard, VersionStamp, Versioned,
    };
    pub use crate::error::{Error, Result};
}
