//! Background cleanup task for expired pairing codes.
//!
//! Runs periodically to delete codes past their TTL and to evict idle
//! rate limiter keys.

use crate::config::CleanupConfig;
use crate::limits::RateLimits;
use crate::storage::SqliteStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    storage: Arc<SqliteStorage>,
    rate_limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;
            run_once(&storage, &rate_limits).await;
        }
    })
}

async fn run_once(storage: &SqliteStorage, rate_limits: &RateLimits) {
    match storage.cleanup_expired_codes().await {
        Ok(0) => tracing::debug!("Cleanup: no expired pairing codes"),
        Ok(deleted) => tracing::info!("Cleanup: deleted {} expired pairing codes", deleted),
        Err(e) => tracing::error!("Cleanup error: {}", e),
    }
    rate_limits.shrink();
}
