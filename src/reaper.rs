//! Background housekeeping: WAL compaction and cache sweeping.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::AvailabilityCache;
use crate::engine::Engine;
use crate::observability;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// One compaction check. Returns whether the WAL was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Drop expired status entries every `every`. Reads already ignore expired
/// entries; this only bounds memory.
pub async fn run_cache_sweeper(cache: Arc<AvailabilityCache>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let evicted = cache.evict_expired();
        metrics::gauge!(observability::CACHE_EVICTED).set(evicted as f64);
        if evicted > 0 {
            debug!(evicted, "swept expired status entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::fixtures::*;
    use chrono::TimeDelta;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("compact_due.wal");
        let clock = Arc::new(ManualClock::new(at(0)));
        let engine = Engine::new(path, Duration::from_millis(200), clock).unwrap();
        let rid = engine.create_room(room("Aurora")).await.unwrap().id;
        for i in 0..3 {
            let b = engine
                .insert_if_no_conflict(Ulid::new(), rid, Ulid::new(), span(i * 60, i * 60 + 30))
                .await
                .unwrap();
            engine.cancel(b.id, b.requester_id).await.unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await);
        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(!compact_if_due(&engine, 5).await);
    }

    #[tokio::test]
    async fn sweeper_evicts_in_background() {
        let path = test_wal_path("sweeper.wal");
        let clock = Arc::new(ManualClock::new(at(0)));
        let engine = Arc::new(Engine::new(path, Duration::from_millis(200), clock.clone()).unwrap());
        let rid = engine.create_room(room("Aurora")).await.unwrap().id;
        let cache = Arc::new(AvailabilityCache::new(engine, clock.clone(), TimeDelta::seconds(60)));
        cache.get_status(rid, false).await.unwrap();
        assert_eq!(cache.len(), 1);

        clock.advance(TimeDelta::seconds(61));
        tokio::spawn(run_cache_sweeper(cache.clone(), Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.is_empty());
    }
}
