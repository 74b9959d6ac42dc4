//! Quantized hierarchical-cell strategy.
//!
//! The path encoder maps a vector to a directory path: components are
//! min-max normalized per vector, grouped `dims_per_level` at a time, and
//! each group's mean is bucketed into one of `bins` bins rendered `%03d`
//! and joined with `/`. Vectors land in the SQLite cell at that path;
//! search expands to the Cartesian product of per-level bin offsets within
//! `radius`. Cells are opened lazily by the [`CellRegistry`] and hold at
//! most `capacity` rows; a full cell routes the insert to the nearest
//! neighbor cell with room.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{LatticeError, Result};
use crate::kernels::distance::unit_similarity;
use crate::models::{sort_by_similarity, Candidate};
use crate::strategy::{FindOptions, StrategyStats};

/// Per-level bin indices for a vector.
pub fn encode_levels(vector: &[f32], bins: usize, dims_per_level: usize) -> Vec<usize> {
    let min = vector.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = vector.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    vector
        .chunks(dims_per_level)
        .map(|group| {
            let mean: f32 = group
                .iter()
                .map(|x| {
                    if range < f32::EPSILON {
                        0.5
                    } else {
                        (x - min) / range
                    }
                })
                .sum::<f32>()
                / group.len() as f32;
            ((mean * (bins as f32 - 1.0)).floor() as usize).min(bins - 1)
        })
        .collect()
}

/// Directory path for a vector, e.g. `"002/000/003"`.
pub fn encode_path(vector: &[f32], bins: usize, dims_per_level: usize) -> String {
    encode_levels(vector, bins, dims_per_level)
        .iter()
        .map(|b| format!("{b:03}"))
        .collect::<Vec<_>>()
        .join("/")
}

/// All paths within `radius` bins of the vector's path, per level,
/// clamped to `[0, bins)`. The vector's own path comes first.
pub fn neighbor_paths(
    vector: &[f32],
    bins: usize,
    dims_per_level: usize,
    radius: i64,
) -> Vec<String> {
    let levels = encode_levels(vector, bins, dims_per_level);

    let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
    for &bin in &levels {
        let mut next = Vec::new();
        for combo in &combos {
            for offset in -radius..=radius {
                let shifted = (bin as i64 + offset).clamp(0, bins as i64 - 1) as usize;
                let mut c = combo.clone();
                c.push(shifted);
                next.push(c);
            }
        }
        next.dedup();
        combos = next;
    }

    let primary: String = levels
        .iter()
        .map(|b| format!("{b:03}"))
        .collect::<Vec<_>>()
        .join("/");

    let mut seen = std::collections::HashSet::new();
    let mut out = vec![primary.clone()];
    seen.insert(primary);
    for combo in combos {
        let path = combo
            .iter()
            .map(|b| format!("{b:03}"))
            .collect::<Vec<_>>()
            .join("/");
        if seen.insert(path.clone()) {
            out.push(path);
        }
    }
    out
}

/// One SQLite-backed cell holding up to `capacity` vectors.
#[derive(Debug)]
struct Cell {
    pool: SqlitePool,
    capacity: usize,
    count: AtomicI64,
}

impl Cell {
    async fn open(root: &Path, path: &str, capacity: usize) -> Result<Self> {
        let dir = root.join(path);
        std::fs::create_dir_all(&dir)
            .map_err(|e| LatticeError::ShardUnavailable(format!("{}: {e}", dir.display())))?;
        let file = dir.join("cell.db");

        let options = SqliteConnectOptions::new()
            .filename(&file)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cells (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM cells")
            .fetch_one(&pool)
            .await?;

        Ok(Self {
            pool,
            capacity,
            count: AtomicI64::new(count),
        })
    }

    fn has_room(&self) -> bool {
        (self.count.load(Ordering::Relaxed) as usize) < self.capacity
    }

    /// Insert or update a row. Returns `false` when the cell is full and
    /// the id is new, without writing.
    async fn try_insert(
        &self,
        id: &str,
        embedding: &[f32],
        metadata: &serde_json::Value,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM cells WHERE id = ?)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        if !exists && !self.has_room() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO cells (id, embedding, metadata) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                embedding = excluded.embedding,
                metadata = excluded.metadata
            "#,
        )
        .bind(id)
        .bind(vec_to_blob(embedding))
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await?;

        if !exists {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM cells WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            self.count.fetch_sub(affected as i64, Ordering::Relaxed);
        }
        Ok(affected > 0)
    }

    /// Exact-cosine scan of every row in the cell.
    async fn scan(&self, query: &[f32], min_similarity: f32) -> Result<Vec<Candidate>> {
        let rows = sqlx::query("SELECT id, embedding, metadata FROM cells")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                let similarity = unit_similarity(query, &vector);
                if similarity < min_similarity {
                    return None;
                }
                let metadata: String = row.get("metadata");
                let metadata =
                    serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null);
                let id: String = row.get("id");
                Some(Candidate::new(id, similarity).with_metadata(metadata))
            })
            .collect())
    }
}

/// Lazily opened cells keyed by path; get-or-insert under the write lock.
#[derive(Debug)]
struct CellRegistry {
    root: PathBuf,
    capacity: usize,
    cells: RwLock<HashMap<String, Arc<Cell>>>,
}

impl CellRegistry {
    fn new(root: PathBuf, capacity: usize) -> Self {
        Self {
            root,
            capacity,
            cells: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_open(&self, path: &str) -> Result<Arc<Cell>> {
        if let Some(cell) = self.cells.read().await.get(path) {
            return Ok(cell.clone());
        }
        let mut cells = self.cells.write().await;
        // Double-checked: another task may have opened it meanwhile.
        if let Some(cell) = cells.get(path) {
            return Ok(cell.clone());
        }
        let cell = Arc::new(Cell::open(&self.root, path, self.capacity).await?);
        cells.insert(path.to_string(), cell.clone());
        Ok(cell)
    }

    fn exists_on_disk(&self, path: &str) -> bool {
        self.root.join(path).join("cell.db").exists()
    }

    /// Relative paths of every cell database under the root.
    fn list_disk_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let p = entry.path();
                if p.is_dir() {
                    stack.push(p);
                } else if p.file_name().map(|n| n == "cell.db").unwrap_or(false) {
                    if let Some(parent) = p.parent() {
                        if let Ok(rel) = parent.strip_prefix(&self.root) {
                            out.push(rel.to_string_lossy().replace('\\', "/"));
                        }
                    }
                }
            }
        }
        out.sort();
        out
    }
}

#[derive(Debug)]
pub struct QuantizedIndex {
    dim: usize,
    bins: usize,
    dims_per_level: usize,
    radius: i64,
    registry: CellRegistry,
    /// id → cell path for the fast delete path; rebuilt lazily after a
    /// restart by falling back to a disk walk.
    locations: HashMap<String, String>,
}

impl QuantizedIndex {
    pub async fn open(
        dim: usize,
        bins: usize,
        dims_per_level: usize,
        capacity: usize,
        radius: i64,
        root: PathBuf,
    ) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| LatticeError::ShardUnavailable(format!("{}: {e}", root.display())))?;
        Ok(Self {
            dim,
            bins: bins.max(2),
            dims_per_level: dims_per_level.max(1),
            radius: radius.max(0),
            registry: CellRegistry::new(root, capacity.max(1)),
            locations: HashMap::new(),
        })
    }

    pub async fn index_document(
        &mut self,
        id: &str,
        metadata: serde_json::Value,
        embedding: &[f32],
    ) -> Result<()> {
        LatticeError::check_dim(self.dim, embedding)?;

        // An update may land in a different cell than the original.
        if self.locations.contains_key(id) {
            self.delete_document(id).await?;
        }

        let paths = neighbor_paths(embedding, self.bins, self.dims_per_level, self.radius);
        for path in &paths {
            let cell = self.registry.get_or_open(path).await?;
            if cell.try_insert(id, embedding, &metadata).await? {
                self.locations.insert(id.to_string(), path.clone());
                return Ok(());
            }
        }

        Err(LatticeError::CellFull(format!(
            "no room in {} cells around {}",
            paths.len(),
            paths[0]
        )))
    }

    pub async fn delete_document(&mut self, id: &str) -> Result<()> {
        if let Some(path) = self.locations.remove(id) {
            let cell = self.registry.get_or_open(&path).await?;
            cell.delete(id).await?;
            return Ok(());
        }

        // No in-memory location (e.g. after restart): sweep the disk tree.
        for path in self.registry.list_disk_paths() {
            let cell = self.registry.get_or_open(&path).await?;
            if cell.delete(id).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    pub async fn find_candidates(&self, query: &[f32], opts: &FindOptions) -> Result<Vec<Candidate>> {
        LatticeError::check_dim(self.dim, query)?;

        let paths = neighbor_paths(query, self.bins, self.dims_per_level, self.radius);
        let mut candidates = Vec::new();
        for path in &paths {
            if !self.registry.exists_on_disk(path) {
                continue;
            }
            let cell = self.registry.get_or_open(path).await?;
            candidates.extend(cell.scan(query, opts.min_similarity).await?);
        }

        sort_by_similarity(&mut candidates);
        candidates.truncate(opts.limit as usize);
        Ok(candidates)
    }

    pub async fn get_stats(&self) -> StrategyStats {
        let cells = self.registry.cells.read().await;
        let doc_count: i64 = cells
            .values()
            .map(|c| c.count.load(Ordering::Relaxed))
            .sum();
        StrategyStats {
            strategy: "quantized".to_string(),
            doc_count: doc_count.max(0) as usize,
            cell_count: Some(self.registry.list_disk_paths().len()),
            ..StrategyStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path_shape() {
        // dim 4, dims_per_level 2 → 2 levels
        let path = encode_path(&[0.2, 0.3, 0.1, 0.4], 4, 2);
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts.len(), 2);
        for p in parts {
            assert_eq!(p.len(), 3);
            assert!(p.parse::<usize>().unwrap() < 4);
        }
    }

    #[test]
    fn test_encode_levels_min_max() {
        // min 0.0, max 1.0: normalized values equal raw values
        let levels = encode_levels(&[0.0, 1.0], 4, 1);
        assert_eq!(levels, vec![0, 3]);
    }

    #[test]
    fn test_encode_constant_vector() {
        // Zero range maps every group to the middle bin.
        let levels = encode_levels(&[0.5, 0.5, 0.5, 0.5], 4, 2);
        assert_eq!(levels, vec![1, 1]);
    }

    #[test]
    fn test_uneven_last_group() {
        // dim 5, dims_per_level 2 → groups of 2, 2, 1
        let levels = encode_levels(&[0.0, 1.0, 0.5, 0.5, 1.0], 4, 2);
        assert_eq!(levels.len(), 3);
    }

    #[test]
    fn test_neighbor_paths_radius_zero() {
        let paths = neighbor_paths(&[0.2, 0.3, 0.1, 0.4], 4, 2, 0);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0], encode_path(&[0.2, 0.3, 0.1, 0.4], 4, 2));
    }

    #[test]
    fn test_neighbor_paths_clamped() {
        // All-equal vector → middle bins; radius 1 on 2 levels → 3×3 = 9
        let paths = neighbor_paths(&[0.0, 1.0, 0.0, 1.0], 4, 2, 1);
        assert!(paths.len() <= 9);
        assert!(!paths.is_empty());
        // primary first
        assert_eq!(paths[0], encode_path(&[0.0, 1.0, 0.0, 1.0], 4, 2));
        for p in &paths {
            for level in p.split('/') {
                assert!(level.parse::<usize>().unwrap() < 4);
            }
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_in_cells() {
        let tmp = tempfile::tempdir().unwrap();
        let mut idx = QuantizedIndex::open(4, 4, 2, 100, 1, tmp.path().to_path_buf())
            .await
            .unwrap();

        idx.index_document("doc3", serde_json::Value::Null, &[0.2, 0.3, 0.1, 0.4])
            .await
            .unwrap();
        idx.index_document("doc4", serde_json::Value::Null, &[0.4, 0.3, 0.2, 0.1])
            .await
            .unwrap();

        let found = idx
            .find_candidates(&[0.2, 0.3, 0.1, 0.4], &FindOptions::with_limit(10))
            .await
            .unwrap();
        assert!(found.iter().any(|c| c.id == "doc3"));
    }

    #[tokio::test]
    async fn test_full_cell_spills_to_neighbor() {
        let tmp = tempfile::tempdir().unwrap();
        let mut idx = QuantizedIndex::open(2, 4, 2, 1, 1, tmp.path().to_path_buf())
            .await
            .unwrap();

        // Same path for both (identical vector shape), capacity 1.
        idx.index_document("first", serde_json::Value::Null, &[0.0, 1.0])
            .await
            .unwrap();
        idx.index_document("second", serde_json::Value::Null, &[0.0, 1.0])
            .await
            .unwrap();

        let stats = idx.get_stats().await;
        assert_eq!(stats.doc_count, 2);
        assert_eq!(stats.cell_count, Some(2));
    }

    #[tokio::test]
    async fn test_cell_full_when_neighborhood_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut idx = QuantizedIndex::open(2, 2, 2, 1, 0, tmp.path().to_path_buf())
            .await
            .unwrap();

        idx.index_document("first", serde_json::Value::Null, &[0.0, 1.0])
            .await
            .unwrap();
        let err = idx
            .index_document("second", serde_json::Value::Null, &[0.0, 1.0])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cell_full");
    }

    #[tokio::test]
    async fn test_delete_after_reopen_sweeps_disk() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut idx = QuantizedIndex::open(2, 4, 2, 10, 1, tmp.path().to_path_buf())
                .await
                .unwrap();
            idx.index_document("persisted", serde_json::Value::Null, &[0.0, 1.0])
                .await
                .unwrap();
        }

        let mut reopened = QuantizedIndex::open(2, 4, 2, 10, 1, tmp.path().to_path_buf())
            .await
            .unwrap();
        reopened.delete_document("persisted").await.unwrap();
        let found = reopened
            .find_candidates(&[0.0, 1.0], &FindOptions::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
