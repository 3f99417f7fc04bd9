//! Version guard for optimistic concurrency control
//!
//! A write is allowed only if the caller's expected version still matches the
//! resource, and every successful write advances the version by exactly one.
//! Callers supply the business mutation; the guard owns the version stamp.

use tracing::{debug, warn};

use crate::error::{Error, ItemConflict, Result};

use super::repository::ResourceRepository;
use super::retry::RetryPolicy;
use super::versioned::Versioned;

/// Words that mark an opaque storage error as a stale-write conflict
const CONFLICT_MARKERS: [&str; 3] = ["version", "optimistic", "concurrent"];

/// Mutation applied to one item of a batch
pub type BatchMutation<'a, R> = Box<dyn FnOnce(&mut R) -> Result<()> + Send + 'a>;

/// One resource of a batch update
pub struct BatchItem<'a, R> {
    pub resource: R,
    pub expected_version: u64,
    mutate: BatchMutation<'a, R>,
}

impl<'a, R> BatchItem<'a, R> {
    pub fn new<F>(resource: R, expected_version: u64, mutate: F) -> Self
    where
        F: FnOnce(&mut R) -> Result<()> + Send + 'a,
    {
        Self {
            resource,
            expected_version,
            mutate: Box::new(mutate),
        }
    }
}

/// A stale write reported by the storage layer
struct StorageConflict {
    entity_id: Option<String>,
    actual: Option<u64>,
}

/// Recognize a persistence failure as a version conflict
fn as_storage_conflict(error: &Error) -> Option<StorageConflict> {
    match error {
        Error::StorageConflict {
            entity_id,
            actual_version,
            ..
        } => Some(StorageConflict {
            entity_id: entity_id.clone(),
            actual: *actual_version,
        }),
        Error::VersionConflict {
            entity_id, actual, ..
        } => Some(StorageConflict {
            entity_id: Some(entity_id.clone()),
            actual: Some(*actual),
        }),
        // Fallback for stores that can only report a message
        Error::Storage(message) => {
            let message = message.to_lowercase();
            CONFLICT_MARKERS
                .iter()
                .any(|marker| message.contains(marker))
                .then_some(StorageConflict {
                    entity_id: None,
                    actual: None,
                })
        }
        _ => None,
    }
}

/// Version guard for optimistic updates
#[derive(Debug, Clone, Default)]
pub struct VersionGuard {
    policy: RetryPolicy,
}

impl VersionGuard {
    /// Create a guard with the given retry policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Get the retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fail with `VersionConflict` unless `resource` is at `expected_version`
    pub fn check_version<R: Versioned + ?Sized>(
        &self,
        resource: &R,
        expected_version: u64,
    ) -> Result<()> {
        let actual = resource.version();
        if actual != expected_version {
            return Err(Error::VersionConflict {
                entity_id: resource.entity_id().to_string(),
                expected: expected_version,
                actual,
            });
        }
        Ok(())
    }

    /// Advance the version by one and stamp the write time (in memory only)
    pub fn update_version<R: Versioned + ?Sized>(&self, resource: &mut R) {
        resource.stamp_mut().bump();
    }

    /// Check, mutate, bump and persist a resource
    ///
    /// Errors from `mutate` are returned unchanged and nothing is persisted.
    /// If persisting fails the stamp is restored to its previous value; a
    /// stale write reported by the store becomes `VersionConflict`.
    pub async fn safe_update<R, F, P>(
        &self,
        resource: &mut R,
        expected_version: u64,
        mutate: F,
        repository: &P,
    ) -> Result<()>
    where
        R: Versioned,
        F: FnOnce(&mut R) -> Result<()>,
        P: ResourceRepository<R> + ?Sized,
    {
        self.check_version(resource, expected_version)?;
        mutate(resource)?;

        let previous = *resource.stamp();
        self.update_version(resource);

        if let Err(e) = repository.persist(resource).await {
            let attempted = resource.version();
            *resource.stamp_mut() = previous;

            return Err(match as_storage_conflict(&e) {
                Some(conflict) => {
                    warn!(
                        entity_id = resource.entity_id(),
                        expected_version,
                        error = %e,
                        "Storage rejected stale write"
                    );
                    Error::VersionConflict {
                        entity_id: resource.entity_id().to_string(),
                        expected: expected_version,
                        actual: conflict.actual.unwrap_or(attempted),
                    }
                }
                None => e,
            });
        }

        debug!(
            entity_id = resource.entity_id(),
            version = resource.version(),
            "Resource updated"
        );
        Ok(())
    }

    /// Reload and update a resource, retrying on version conflicts
    ///
    /// Each attempt loads a fresh copy and takes its current version as the
    /// expected one. Conflicts back off per the guard's policy; any other
    /// error aborts at once. `mutate` may run once per attempt.
    pub async fn update_with_retry<R, F, P>(
        &self,
        entity_id: &str,
        max_retries: u32,
        repository: &P,
        mut mutate: F,
    ) -> Result<R>
    where
        R: Versioned,
        F: FnMut(&mut R) -> Result<()>,
        P: ResourceRepository<R> + ?Sized,
    {
        let attempts = max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let mut resource = repository
                .load(entity_id)
                .await?
                .ok_or_else(|| Error::not_found("resource", entity_id))?;
            let expected = resource.version();

            match self
                .safe_update(&mut resource, expected, &mut mutate, repository)
                .await
            {
                Ok(()) => return Ok(resource),
                Err(e @ Error::VersionConflict { .. }) => {
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        let delay = self.policy.delay_for(attempt);
                        debug!(
                            entity_id,
                            attempt,
                            wait_ms = delay.as_millis() as u64,
                            "Version conflict, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(entity_id, attempts, "Retry budget exhausted");
        Err(Error::RetryExhausted {
            entity_id: entity_id.to_string(),
            attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| Error::not_found("resource", entity_id)),
            ),
        })
    }

    /// `update_with_retry` using the policy's `max_retries`
    pub async fn update_with_default_retry<R, F, P>(
        &self,
        entity_id: &str,
        repository: &P,
        mutate: F,
    ) -> Result<R>
    where
        R: Versioned,
        F: FnMut(&mut R) -> Result<()>,
        P: ResourceRepository<R> + ?Sized,
    {
        self.update_with_retry(entity_id, self.policy.max_retries, repository, mutate)
            .await
    }

    /// Validate, mutate and persist several resources together
    ///
    /// Every expected version is checked before anything is mutated; all
    /// mismatches are reported in one `BatchConflict`. The mutated resources
    /// are written with a single `persist_all` and returned on success.
    pub async fn batch_update<R, P>(
        &self,
        items: Vec<BatchItem<'_, R>>,
        repository: &P,
    ) -> Result<Vec<R>>
    where
        R: Versioned,
        P: ResourceRepository<R> + ?Sized,
    {
        let conflicts: Vec<ItemConflict> = items
            .iter()
            .filter(|item| item.resource.version() != item.expected_version)
            .map(|item| ItemConflict {
                entity_id: item.resource.entity_id().to_string(),
                expected: item.expected_version,
                actual: Some(item.resource.version()),
            })
            .collect();

        if !conflicts.is_empty() {
            warn!(conflicts = conflicts.len(), "Batch rejected before mutation");
            return Err(Error::BatchConflict { conflicts });
        }

        let mut resources = Vec::with_capacity(items.len());
        let mut expected = Vec::with_capacity(items.len());
        for item in items {
            let BatchItem {
                mut resource,
                expected_version,
                mutate,
            } = item;
            mutate(&mut resource)?;
            self.update_version(&mut resource);
            expected.push(expected_version);
            resources.push(resource);
        }

        if let Err(e) = repository.persist_all(&resources).await {
            let Some(conflict) = as_storage_conflict(&e) else {
                return Err(e);
            };
            warn!(error = %e, "Storage rejected batch write");

            let named = conflict.entity_id.as_deref().and_then(|id| {
                resources
                    .iter()
                    .position(|resource| resource.entity_id() == id)
            });

            let conflicts = match named {
                Some(index) => vec![ItemConflict {
                    entity_id: resources[index].entity_id().to_string(),
                    expected: expected[index],
                    actual: conflict.actual,
                }],
                None => resources
                    .iter()
                    .zip(&expected)
                    .map(|(resource, expected)| ItemConflict {
                        entity_id: resource.entity_id().to_string(),
                        expected: *expected,
                        actual: None,
                    })
                    .collect(),
            };
            return Err(Error::BatchConflict { conflicts });
        }

        debug!(count = resources.len(), "Batch updated");
        Ok(resources)
    }
}
