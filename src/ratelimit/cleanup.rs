//! Background sweep that bounds limiter memory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::limiter::RateLimiterRegistry;

/// Handle to the periodic cleanup task.
///
/// The task stops when [`CleanupTask::shutdown`] is awaited or the handle is
/// dropped, so no timer outlives its owner.
pub struct CleanupTask {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Start sweeping `registry` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(registry: Arc<RateLimiterRegistry>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        info!(interval_ms = interval.as_millis() as u64, "Starting rate limit cleanup task");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing is stale yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.cleanup_all();
                        if removed > 0 {
                            debug!(removed = removed, remaining = registry.tracked(), "Cleaned up rate limit state");
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Rate limit cleanup task stopped");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Rate limit cleanup task shut down");
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
