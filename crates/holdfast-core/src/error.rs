//! Error types for Holdfast

use thiserror::Error;
use uuid::Uuid;

use crate::domain::locking::Lock;

/// Result type alias using Holdfast's Error
pub type Result<T> = std::result::Result<T, Error>;

/// One conflicting item of a batch update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemConflict {
    /// Entity that conflicted
    pub entity_id: String,
    /// Version the caller expected
    pub expected: u64,
    /// Version found, when known
    pub actual: Option<u64>,
}

impl std::fmt::Display for ItemConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.actual {
            Some(actual) => write!(
                f,
                "{} (expected v{}, found v{})",
                self.entity_id, self.expected, actual
            ),
            None => write!(f, "{} (expected v{})", self.entity_id, self.expected),
        }
    }
}

fn join_conflicts(conflicts: &[ItemConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Holdfast error types
#[derive(Error, Debug)]
pub enum Error {
    // Optimistic errors (E100-E199)
    #[error("Version conflict on '{entity_id}': expected v{expected}, found v{actual}. Reload and try again.")]
    VersionConflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Batch update conflicted on {} item(s): {}", .conflicts.len(), join_conflicts(.conflicts))]
    BatchConflict { conflicts: Vec<ItemConflict> },

    #[error("Update of '{entity_id}' failed after {attempts} attempt(s): {source}")]
    RetryExhausted {
        entity_id: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Stale write rejected by storage: {message}")]
    StorageConflict {
        entity_id: Option<String>,
        actual_version: Option<u64>,
        message: String,
    },

    // Pessimistic errors (E200-E299)
    #[error("Resource '{entity_id}' is locked by {} until {}", .current_lock.owner_name, .current_lock.expires_at)]
    LockConflict {
        entity_id: String,
        current_lock: Box<Lock>,
    },

    #[error("Lock {lock_id} has expired")]
    LockExpired { lock_id: Uuid },

    #[error("Lock {lock_id} is not owned by '{owner_id}'")]
    NotLockOwner { lock_id: Uuid, owner_id: String },

    // Lookup errors (E300-E399)
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    // Storage errors (E400-E499)
    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Caller errors (E500-E599)
    #[error(transparent)]
    Domain(#[from] anyhow::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a lookup failure
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for a typed stale-write signal from a storage layer
    pub fn storage_conflict(
        entity_id: impl Into<String>,
        actual_version: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        Self::StorageConflict {
            entity_id: Some(entity_id.into()),
            actual_version,
            message: message.into(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::VersionConflict { .. } => "E100",
            Self::BatchConflict { .. } => "E101",
            Self::RetryExhausted { .. } => "E102",
            Self::StorageConflict { .. } => "E103",
            Self::LockConflict { .. } => "E200",
            Self::LockExpired { .. } => "E201",
            Self::NotLockOwner { .. } => "E202",
            Self::NotFound { .. } => "E300",
            Self::Storage(_) => "E400",
            Self::Io(_) => "E401",
            Self::Serialization(_) => "E402",
            Self::Domain(_) => "E500",
            Self::Config(_) => "E600",
        }
    }

    /// Get suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::VersionConflict { entity_id, .. } => {
                Some(format!("Reload '{}' and reapply the change", entity_id))
            }
            Self::BatchConflict { .. } => Some("Reload the batch and resubmit".to_string()),
            Self::LockConflict { current_lock, .. } => Some(format!(
                "Wait for {} to finish or ask an operator to run `holdfast locks force-release {}`",
                current_lock.owner_name, current_lock.lock_id
            )),
            Self::LockExpired { .. } => Some("Acquire the lock again".to_string()),
            Self::Config(_) => Some("holdfast config list".to_string()),
            _ => None,
        }
    }

    /// Whether this error is a concurrency conflict (maps to HTTP 409 upstream)
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::BatchConflict { .. } | Self::LockConflict { .. }
        )
    }
}
