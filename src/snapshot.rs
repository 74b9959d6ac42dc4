//! Strategy state snapshots.
//!
//! Persistence is best-effort: a snapshot captures the serialized strategy
//! state at `{storage_path}/snapshots/{strategy}-{unix_ts}.bin`, and
//! `load_latest` restores the newest one for a strategy name. There is no
//! write-ahead log; anything indexed after the last snapshot is rebuilt
//! from shard storage or re-indexed.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{LatticeError, Result};
use crate::strategy::IndexStrategy;

/// Write a snapshot, returning its path.
pub fn save(strategy: &IndexStrategy, dir: &Path) -> Result<PathBuf> {
    let bytes = strategy.serialize()?;
    std::fs::create_dir_all(dir)
        .map_err(|e| LatticeError::Serialization(format!("{}: {e}", dir.display())))?;

    let ts = chrono::Utc::now().timestamp();
    let path = dir.join(format!("{}-{ts}.bin", strategy.name()));
    std::fs::write(&path, bytes)
        .map_err(|e| LatticeError::Serialization(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "wrote strategy snapshot");
    Ok(path)
}

/// Restore the most recent snapshot for `name`, if any exists.
pub fn load_latest(name: &str, dir: &Path) -> Result<Option<IndexStrategy>> {
    let prefix = format!("{name}-");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(None);
    };

    let mut newest: Option<PathBuf> = None;
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with(&prefix) && file_name.ends_with(".bin") {
            let path = entry.path();
            if newest.as_ref().map(|n| path > *n).unwrap_or(true) {
                newest = Some(path);
            }
        }
    }

    let Some(path) = newest else {
        return Ok(None);
    };
    let bytes = std::fs::read(&path)
        .map_err(|e| LatticeError::Serialization(format!("{}: {e}", path.display())))?;
    Ok(Some(IndexStrategy::deserialize(name, &bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::strategy::FindOptions;

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            embedding_dim: 4,
            ..Config::default()
        };

        let mut strategy = IndexStrategy::create("hnsw", &config).await.unwrap();
        strategy
            .index_document("a", serde_json::Value::Null, &[1.0, 0.0, 0.0, 0.0])
            .await
            .unwrap();

        save(&strategy, tmp.path()).unwrap();
        let restored = load_latest("hnsw", tmp.path()).unwrap().unwrap();
        let found = restored
            .find_candidates(&[1.0, 0.0, 0.0, 0.0], &FindOptions::with_limit(1))
            .await
            .unwrap();
        assert_eq!(found[0].id, "a");
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_latest("hnsw", tmp.path()).unwrap().is_none());
        assert!(load_latest("hnsw", &tmp.path().join("nope")).unwrap().is_none());
    }
}
