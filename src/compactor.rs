use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::observability::COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a partition's WAL once enough appends have
/// piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(COMPACTIONS_TOTAL).increment(1);
            tracing::info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            tracing::warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), EngineConfig::default()).unwrap();

        let est = Ulid::new();
        engine
            .create_establishment(est, "Studio".into(), Ulid::new(), 0)
            .await
            .unwrap();
        let window = Ulid::new();
        let nine = TimeOfDay::from_hm(9, 0).unwrap();
        let noon = TimeOfDay::from_hm(12, 0).unwrap();
        engine.add_window(window, est, 1, nine, noon).await.unwrap();
        engine.remove_window(window).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        assert!(!compact_if_due(&engine, 10).await);
        let before = std::fs::metadata(&path).unwrap().len();

        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compaction should drop the add/remove pair");

        let restored = Engine::new(path, EngineConfig::default()).unwrap();
        assert_eq!(restored.list_establishments().await.len(), 1);
        assert!(restored.windows(est).await.unwrap().is_empty());
    }
}
