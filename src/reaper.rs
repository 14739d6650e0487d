use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::{now_ms, Engine};

/// Force-release expired slot locks on every tick. Each release is broadcast
/// as `unlocked`, exactly like an explicit release.
pub async fn run_lock_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        for lock in engine.sweep_expired_locks(now_ms()) {
            debug!("expired lock on {} held by {}", lock.key(), lock.holder_id);
        }
    }
}

/// Rewrite the WAL once enough appends have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
