use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::scheduler::store::JobStore;

/// Shortest pause between sweeps; a zero interval is raised to this.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically deletes terminal jobs older than the retention window.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    store: Arc<JobStore>,
    retention: Duration,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(store: Arc<JobStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval: interval.max(MIN_SWEEP_INTERVAL),
        }
    }

    /// Run a single sweep and return how many jobs were deleted.
    pub async fn sweep_once(&self) -> Result<usize> {
        let store = Arc::clone(&self.store);
        let retention = self.retention;
        tokio::task::spawn_blocking(move || store.delete_expired(retention))
            .await
            .map_err(|e| SchedulerError::Internal(format!("sweep task failed: {}", e)))?
    }

    /// Sweep on every tick until `shutdown` is cancelled. A failed sweep is
    /// logged and retried on the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            retention_ms = self.retention.as_millis() as u64,
            interval_ms = self.interval.as_millis() as u64,
            "Garbage collector started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(deleted) => tracing::info!(deleted, "Expired jobs deleted"),
                        Err(e) => tracing::error!(error = %e, "Garbage collection sweep failed"),
                    }
                }
            }
        }

        tracing::info!("Garbage collector stopped");
    }
}
