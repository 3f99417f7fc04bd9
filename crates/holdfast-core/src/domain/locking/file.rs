//! File-backed lock store
//!
//! One pretty-printed JSON record per resource key inside a lock directory.
//! New records are written to a temp file and hard-linked into place, which
//! fails if the target exists, so insertion is atomic across processes that
//! share the directory. Renewals replace the record with an atomic rename.
//!
//! File names percent-encode every byte of the key outside `[A-Za-z0-9_-]`,
//! so each key has its own file and no lock file name starts with a dot.
//!
//! Filesystem calls block, so every store operation runs on tokio's blocking
//! pool. Read-modify-write sequences are serialized inside one process but
//! are best-effort between processes: two processes reaping the same expired
//! record at the same instant can race.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::store::{InsertOutcome, LockStore};
use super::types::{Lock, lock_key};

const LOCK_EXTENSION: &str = "lock";

/// What was found at a lock file path
enum LockFile {
    Missing,
    Corrupted,
    Valid(Lock),
}

/// File name for a key: bytes outside `[A-Za-z0-9_-]` become `%XX`
fn lock_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + LOCK_EXTENSION.len() + 1);
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name.push('.');
    name.push_str(LOCK_EXTENSION);
    name
}

/// Lock store that keeps records as JSON files in a directory
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: Arc<LockDir>,
}

impl FileLockStore {
    /// Create a store rooted at `lock_dir`; call `initialize` before use
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(LockDir {
                path: lock_dir.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Create the lock store and its directory
    pub async fn open(lock_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(lock_dir);
        store.initialize().await?;
        Ok(store)
    }

    /// Get the lock directory
    pub fn lock_dir(&self) -> &Path {
        &self.dir.path
    }

    /// Path of the file holding the record for a resource
    pub fn lock_file_path(&self, resource_type: &str, resource_id: &str) -> PathBuf {
        self.dir.lock_file_path(&lock_key(resource_type, resource_id))
    }

    /// Create the lock directory if needed
    pub async fn initialize(&self) -> Result<()> {
        self.blocking(LockDir::initialize).await
    }

    /// Run a filesystem operation on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&LockDir) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        tokio::task::spawn_blocking(move || op(dir.as_ref()))
            .await
            .map_err(|e| Error::Storage(format!("Lock file task failed: {}", e)))?
    }
}

/// The lock directory, shared by every clone of a store
#[derive(Debug)]
struct LockDir {
    path: PathBuf,

    /// Serializes this process's read-modify-write sequences
    write_lock: Mutex<()>,
}

impl LockDir {
    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path).map_err(|e| {
            Error::Storage(format!(
                "Failed to create lock directory {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Get the path to a lock file
    fn lock_file_path(&self, key: &str) -> PathBuf {
        self.path.join(lock_file_name(key))
    }

    fn temp_file_path(&self) -> PathBuf {
        self.path.join(format!(".{}.tmp", Uuid::new_v4()))
    }

    /// Write a record to a fresh temp file and return its path
    fn write_temp(&self, lock: &Lock) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(lock)?;
        let temp = self.temp_file_path();
        std::fs::write(&temp, json).map_err(|e| {
            Error::Storage(format!("Failed to write lock file {}: {}", temp.display(), e))
        })?;
        Ok(temp)
    }

    /// Read lock info from a file
    fn read_lock_file(path: &Path) -> Result<LockFile> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockFile::Missing),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read lock file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        match serde_json::from_str(&contents) {
            Ok(lock) => Ok(LockFile::Valid(lock)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Lock file is corrupted");
                Ok(LockFile::Corrupted)
            }
        }
    }

    /// Remove a file, treating "already gone" as success
    fn remove_file(path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Storage(format!(
                "Failed to remove lock file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Try to link a temp record into place; false if the target exists
    fn link_into_place(temp: &Path, target: &Path) -> Result<bool> {
        match std::fs::hard_link(temp, target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Storage(format!(
                "Failed to create lock file {}: {}",
                target.display(),
                e
            ))),
        }
    }

    /// All lock files currently in the directory
    fn lock_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to list lock directory {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        Ok(entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext == LOCK_EXTENSION)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Read every listed file, skipping those that vanished since listing
    fn read_all(paths: Vec<PathBuf>) -> Result<Vec<(PathBuf, LockFile)>> {
        let mut found = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_lock_file(&path)? {
                LockFile::Missing => {
                    debug!(path = %path.display(), "Lock file removed during scan");
                }
                file => found.push((path, file)),
            }
        }
        Ok(found)
    }

    /// Every readable record, paired with its path
    fn scan(&self) -> Result<Vec<(PathBuf, LockFile)>> {
        Self::read_all(self.lock_files()?)
    }

    fn get(&self, key: &str) -> Result<Option<Lock>> {
        match Self::read_lock_file(&self.lock_file_path(key))? {
            LockFile::Valid(lock) if lock.lock_key() == key => Ok(Some(lock)),
            _ => Ok(None),
        }
    }

    fn find(&self, lock_id: Uuid) -> Result<Option<Lock>> {
        Ok(self.scan()?.into_iter().find_map(|(_, file)| match file {
            LockFile::Valid(lock) if lock.lock_id == lock_id => Some(lock),
            _ => None,
        }))
    }

    fn insert(&self, lock: &Lock) -> Result<InsertOutcome> {
        let _guard = self.serialize();
        self.initialize()?;

        let key = lock.lock_key();
        let target = self.lock_file_path(&key);
        let temp = self.write_temp(lock)?;
        let outcome = Self::insert_from_temp(&key, &temp, &target);
        Self::remove_file(&temp)?;
        outcome
    }

    fn insert_from_temp(key: &str, temp: &Path, target: &Path) -> Result<InsertOutcome> {
        // Second pass runs after reaping an expired or corrupted record
        for _ in 0..2 {
            if Self::link_into_place(temp, target)? {
                return Ok(InsertOutcome::Inserted);
            }

            match Self::read_lock_file(target)? {
                LockFile::Valid(existing) if existing.lock_key() != key => {
                    return Err(Self::foreign_record(target, &existing, key));
                }
                LockFile::Valid(existing) if existing.is_active() => {
                    return Ok(InsertOutcome::Occupied(existing));
                }
                LockFile::Valid(existing) => {
                    debug!(lock_key = %existing.lock_key(), "Replacing expired lock file");
                    Self::remove_file(target)?;
                }
                LockFile::Corrupted => {
                    debug!(path = %target.display(), "Replacing corrupted lock file");
                    Self::remove_file(target)?;
                }
                LockFile::Missing => {}
            }
        }

        // Another process won both rounds
        match Self::read_lock_file(target)? {
            LockFile::Valid(existing) if existing.lock_key() != key => {
                Err(Self::foreign_record(target, &existing, key))
            }
            LockFile::Valid(existing) => Ok(InsertOutcome::Occupied(existing)),
            _ => Err(Error::Storage(format!(
                "Lock file {} is contended",
                target.display()
            ))),
        }
    }

    /// A file whose record belongs to a different key than its name encodes
    fn foreign_record(target: &Path, existing: &Lock, key: &str) -> Error {
        Error::Storage(format!(
            "Lock file {} holds a record for '{}', not '{}'",
            target.display(),
            existing.lock_key(),
            key
        ))
    }

    fn replace(&self, lock: &Lock) -> Result<bool> {
        let _guard = self.serialize();

        let key = lock.lock_key();
        let target = self.lock_file_path(&key);
        let current = match Self::read_lock_file(&target)? {
            LockFile::Valid(current) => current,
            _ => return Ok(false),
        };
        if current.lock_key() != key || current.lock_id != lock.lock_id || current.is_expired() {
            debug!(lock_key = %key, lock_id = %lock.lock_id, "Lock record changed before replace");
            return Ok(false);
        }

        let temp = self.write_temp(lock)?;
        if let Err(e) = std::fs::rename(&temp, &target) {
            let _ = Self::remove_file(&temp);
            return Err(Error::Storage(format!(
                "Failed to write lock file {}: {}",
                target.display(),
                e
            )));
        }
        Ok(true)
    }

    fn delete(&self, lock_id: Uuid) -> Result<bool> {
        let _guard = self.serialize();

        for (path, file) in self.scan()? {
            if let LockFile::Valid(lock) = file {
                if lock.lock_id == lock_id {
                    return Self::remove_file(&path);
                }
            }
        }
        Ok(false)
    }

    fn cleanup_expired(&self) -> Result<usize> {
        let _guard = self.serialize();
        let mut cleaned = 0;

        for (path, file) in self.scan()? {
            let stale = match &file {
                LockFile::Valid(lock) => lock.is_expired(),
                LockFile::Corrupted => true,
                LockFile::Missing => false,
            };

            if stale && Self::remove_file(&path)? {
                info!(path = %path.display(), "Cleaned up stale lock file");
                cleaned += 1;
            }
        }

        Ok(cleaned)
    }

    fn list_active(&self) -> Result<Vec<Lock>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter_map(|(_, file)| match file {
                LockFile::Valid(lock) if lock.is_active() => Some(lock),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn get_lock(&self, resource_type: &str, resource_id: &str) -> Result<Option<Lock>> {
        let key = lock_key(resource_type, resource_id);
        self.blocking(move |dir| dir.get(&key)).await
    }

    async fn find_lock(&self, lock_id: Uuid) -> Result<Option<Lock>> {
        self.blocking(move |dir| dir.find(lock_id)).await
    }

    async fn insert_if_absent(&self, lock: &Lock) -> Result<InsertOutcome> {
        let lock = lock.clone();
        self.blocking(move |dir| dir.insert(&lock)).await
    }

    async fn replace_lock(&self, lock: &Lock) -> Result<bool> {
        let lock = lock.clone();
        self.blocking(move |dir| dir.replace(&lock)).await
    }

    async fn delete_lock(&self, lock_id: Uuid) -> Result<bool> {
        self.blocking(move |dir| dir.delete(lock_id)).await
    }

    async fn cleanup_expired_locks(&self) -> Result<usize> {
        self.blocking(LockDir::cleanup_expired).await
    }

    async fn get_user_locks(&self, owner_id: &str) -> Result<Vec<Lock>> {
        Ok(self
            .list_locks()
            .await?
            .into_iter()
            .filter(|lock| lock.is_owned_by(owner_id))
            .collect())
    }

    async fn list_locks(&self) -> Result<Vec<Lock>> {
        self.blocking(LockDir::list_active).await
    }
}
