//! Retention sweep for finished jobs
//!
//! Terminal jobs stay queryable for the configured retention period so
//! late pollers still see their final state. After that they are dropped
//! from memory, unless a log consumer is still attached. The on-disk job
//! directory (config snapshot and artifacts) is left in place.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::JobManager;

/// Run the retention task until `cancel` fires
pub async fn run_retention(
    jobs: Arc<JobManager>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    tracing::info!(
        "Starting job retention task (retention: {:?}, check interval: {:?})",
        retention,
        interval
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = jobs.sweep_expired(retention);
                if removed > 0 {
                    tracing::info!("Removed {} expired jobs", removed);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Job retention task shutting down");
                break;
            }
        }
    }
}
