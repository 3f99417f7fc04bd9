//! Concurrency-control domains

pub mod locking;
pub mod versioning;
