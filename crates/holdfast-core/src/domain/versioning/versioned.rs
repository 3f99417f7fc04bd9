//! Version stamps carried by optimistically-controlled resources

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version and last-write time of a resource
///
/// Only `VersionGuard` advances a stamp. Hosts create stamps with `new` for
/// fresh resources and `at` when rehydrating from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStamp {
    version: u64,
    updated_at: DateTime<Utc>,
}

impl VersionStamp {
    /// Stamp for a newly created resource (version 0)
    pub fn new() -> Self {
        Self {
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Stamp as loaded from storage
    pub fn at(version: u64, updated_at: DateTime<Utc>) -> Self {
        Self {
            version,
            updated_at,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub(crate) fn bump(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Default for VersionStamp {
    fn default() -> Self {
        Self::new()
    }
}

/// A business resource protected by optimistic concurrency control
pub trait Versioned: Send + Sync {
    /// Opaque identifier of the resource
    fn entity_id(&self) -> &str;

    fn stamp(&self) -> &VersionStamp;

    fn stamp_mut(&mut self) -> &mut VersionStamp;

    /// Current version
    fn version(&self) -> u64 {
        self.stamp().version()
    }

    /// Time of the last successful write
    fn updated_at(&self) -> DateTime<Utc> {
        self.stamp().updated_at()
    }
}

impl<T: Versioned + ?Sized> Versioned for Box<T> {
    fn entity_id(&self) -> &str {
        (**self).entity_id()
    }

    fn stamp(&self) -> &VersionStamp {
        (**self).stamp()
    }

    fn stamp_mut(&mut self) -> &mut VersionStamp {
        (**self).stamp_mut()
    }
}
