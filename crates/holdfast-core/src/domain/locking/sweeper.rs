//! Background sweep of expired locks
//!
//! Expiry is passive (checked on read), so the sweep only keeps the store
//! from accumulating dead records. Sweep failures are logged and the task
//! keeps running.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::manager::LockManager;

/// Handle to a running cleanup task
#[derive(Debug)]
pub struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Token that stops the task when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the task has stopped
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task and wait for it to exit
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lock cleanup task ended abnormally");
        }
    }
}

/// Lower bound on the sweep period
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

impl LockManager {
    /// Spawn a task that runs `cleanup_expired_locks` every `interval`
    ///
    /// Uses `config().cleanup_interval` when `interval` is None. A zero
    /// interval is raised to one millisecond. Must be called from within a
    /// tokio runtime.
    pub fn spawn_cleanup_task(&self, interval: Option<Duration>) -> CleanupTask {
        let period = interval
            .unwrap_or(self.config().cleanup_interval)
            .max(MIN_SWEEP_INTERVAL);
        let token = CancellationToken::new();
        let manager = self.clone();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        debug!("Lock cleanup task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.cleanup_expired_locks().await {
                            warn!(error = %e, "Lock cleanup sweep failed");
                        }
                    }
                }
            }
        });

        CleanupTask { token, handle }
    }
}
