use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;

/// Compact the WAL if at least `threshold` events were appended since the last compaction.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    debug!("{appends} appends since last compaction, compacting");
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("wal compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically compacts the WAL once it has grown past `threshold`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}
