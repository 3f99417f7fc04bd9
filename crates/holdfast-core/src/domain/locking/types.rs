//! Lock records and configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Build the store key for a resource
///
/// `%` and `:` inside either part are percent-escaped, so the one bare `:`
/// always separates type from id and distinct pairs never share a key.
pub fn lock_key(resource_type: &str, resource_id: &str) -> String {
    format!("{}:{}", escape_key_part(resource_type), escape_key_part(resource_id))
}

fn escape_key_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

/// Convert a std duration to a chrono offset, saturating on overflow
pub(crate) fn ttl_offset(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

/// An exclusive, time-boxed ownership record on a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Lock ID
    pub lock_id: Uuid,

    /// Kind of resource locked (e.g. "Order")
    pub resource_type: String,

    /// Resource identifier within its type
    pub resource_id: String,

    /// Principal that owns the lock
    pub owner_id: String,

    /// Display name of the owner
    pub owner_name: String,

    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,

    /// When the lock expires
    pub expires_at: DateTime<Utc>,

    /// Number of times this lock has been renewed
    #[serde(default)]
    pub renewal_count: u32,
}

impl Lock {
    /// Create a fresh lock starting now
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        owner_id: impl Into<String>,
        owner_name: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            owner_name: owner_name.into(),
            acquired_at: now,
            expires_at: now
                .checked_add_signed(ttl_offset(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            renewal_count: 0,
        }
    }

    /// Whether the lock is still in force
    pub fn is_active(&self) -> bool {
        Utc::now() < self.expires_at
    }

    /// Check if the lock is expired
    pub fn is_expired(&self) -> bool {
        !self.is_active()
    }

    /// Whether `owner_id` holds this lock
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Push the expiry out to `now + ttl`
    pub fn renew(&mut self, ttl: Duration) {
        self.expires_at = Utc::now()
            .checked_add_signed(ttl_offset(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.renewal_count += 1;
    }

    /// Get the store key of the locked resource
    pub fn lock_key(&self) -> String {
        lock_key(&self.resource_type, &self.resource_id)
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lock[{}] held by {} ({}) until {}",
            self.lock_key(),
            self.owner_name,
            self.owner_id,
            self.expires_at
        )
    }
}

/// Configuration for the lock manager
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Base directory for file-backed lock records
    pub lock_dir: PathBuf,

    /// TTL applied when a caller does not pass one
    pub default_ttl: Duration,

    /// Interval between background expiry sweeps
    pub cleanup_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from(".holdfast/locks"),
            default_ttl: Duration::from_secs(300), // 5 minutes
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl LockConfig {
    /// Create a config with a custom lock directory
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Set the default TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the sweep interval
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}
