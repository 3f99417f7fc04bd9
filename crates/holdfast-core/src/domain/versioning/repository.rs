//! Host storage contract for versioned resources
//!
//! The host application owns persistence. `VersionGuard` only needs to load a
//! fresh copy of a resource and to write one back; a write against a stale
//! version must fail with `Error::StorageConflict`.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

use super::versioned::Versioned;

/// Repository trait for versioned resource persistence
#[async_trait]
pub trait ResourceRepository<R: Versioned>: Send + Sync {
    /// Load a fresh copy of a resource
    async fn load(&self, id: &str) -> Result<Option<R>>;

    /// Write a resource whose stamp was just advanced
    async fn persist(&self, resource: &R) -> Result<()>;

    /// Write several resources as one batch
    ///
    /// The default writes one by one and is not atomic; stores with
    /// transactions should override it.
    async fn persist_all(&self, resources: &[R]) -> Result<()> {
        for resource in resources {
            self.persist(resource).await?;
        }
        Ok(())
    }
}

/// Map-backed repository that enforces version compare-and-set on write
///
/// A write is accepted only when the incoming version is exactly one past
/// the stored version (or the resource is new). Useful for tests and as a
/// reference for host implementations.
#[derive(Debug)]
pub struct InMemoryRepository<R> {
    records: RwLock<HashMap<String, R>>,
}

impl<R> Default for InMemoryRepository<R> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: Versioned + Clone> InMemoryRepository<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository, bypassing version checks
    pub async fn insert(&self, resource: R) {
        let mut records = self.records.write().await;
        records.insert(resource.entity_id().to_string(), resource);
    }

    /// Get the stored copy of a resource
    pub async fn get(&self, id: &str) -> Option<R> {
        self.records.read().await.get(id).cloned()
    }

    fn check_write(records: &HashMap<String, R>, resource: &R) -> Result<()> {
        let stored = records.get(resource.entity_id()).map(Versioned::version);
        let accepted = match stored {
            Some(current) => resource.version() == current + 1,
            None => true,
        };

        if accepted {
            Ok(())
        } else {
            Err(Error::storage_conflict(
                resource.entity_id(),
                stored,
                format!(
                    "write of v{} over stored v{}",
                    resource.version(),
                    stored.unwrap_or_default()
                ),
            ))
        }
    }
}

#[async_trait]
impl<R: Versioned + Clone> ResourceRepository<R> for InMemoryRepository<R> {
    async fn load(&self, id: &str) -> Result<Option<R>> {
        Ok(self.get(id).await)
    }

    async fn persist(&self, resource: &R) -> Result<()> {
        let mut records = self.records.write().await;
        Self::check_write(&records, resource)?;
        records.insert(resource.entity_id().to_string(), resource.clone());
        Ok(())
    }

    async fn persist_all(&self, resources: &[R]) -> Result<()> {
        let mut records = self.records.write().await;
        for resource in resources {
            Self::check_write(&records, resource)?;
        }
        for resource in resources {
            records.insert(resource.entity_id().to_string(), resource.clone());
        }
        Ok(())
    }
}
