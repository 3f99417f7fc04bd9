//! Optimistic version control
//!
//! Resources carry a `VersionStamp`. A write names the version it was based
//! on; if the resource moved on in the meantime the write is rejected with a
//! version conflict instead of silently overwriting the newer state.
//!
//! # Architecture
//!
//! - **Versioned**: trait implemented by host resources
//! - **ResourceRepository**: host storage contract (load, persist)
//! - **VersionGuard**: check, safe update, retrying update, batch update
//! - **RetryPolicy**: exponential backoff between conflict retries
//!
//! # Example
//!
//! ```ignore
//! use holdfast_core::domain::versioning::VersionGuard;
//!
//! let guard = VersionGuard::default();
//!
//! let user = guard
//!     .update_with_retry("u1", 3, &users, |user: &mut User| {
//!         user.email = new_email.clone();
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod guard;
pub mod repository;
pub mod retry;
pub mod versioned;

pub use guard::{BatchItem, BatchMutation, VersionGuard};
pub use repository::{InMemoryRepository, ResourceRepository};
pub use retry::RetryPolicy;
pub use versioned::{VersionStamp, Versioned};
