use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;

const COMPACT_POLL_SECS: u64 = 30;

/// Background task that periodically re-verifies every account's entry chain.
/// `audit_account` logs and counts individual faults; this loop drives it and
/// summarizes each pass. An interval of 0 disables the task.
pub async fn run_auditor(engine: Arc<Engine>, interval_secs: u64, shutdown: CancellationToken) {
    if interval_secs == 0 {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let reports = engine.audit_all().await;
        let faults = reports.iter().filter(|r| !r.consistent).count();
        if faults > 0 {
            warn!("audit pass: {faults} of {} accounts inconsistent", reports.len());
        } else {
            tracing::debug!("audit pass: {} accounts clean", reports.len());
        }
    }
}

/// Background task that folds the WAL into a snapshot once enough appends have
/// accumulated. A threshold of 0 disables the task.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    if threshold == 0 {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(COMPACT_POLL_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::error!("compaction failed: {e}"),
            }
        }
    }
}
