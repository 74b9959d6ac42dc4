//! Index strategies.
//!
//! Six interchangeable ANN index variants behind one contract, dispatched
//! through the [`IndexStrategy`] sum type:
//!
//! | Name | Variant | Sketch |
//! |------|---------|--------|
//! | `centroid` | [`CentroidIndex`] | closest-centroid shard placement, top-K probe |
//! | `quantized` | [`QuantizedIndex`] | path-encoded hierarchical SQLite cells |
//! | `hnsw` | [`HnswIndex`] | navigable small-world graph |
//! | `binary` | [`BinaryIndex`] | binary codes + Hamming scan |
//! | `ivf` | [`IvfIndex`] | inverted file over k-means lists |
//! | `pq` | [`PqIndex`] | product-quantization codes + ADC |
//!
//! Strategies are state transformers: every failure is a typed error, and
//! results are always sorted by descending similarity with ties broken by
//! ascending id. Deleting an unknown id is a no-op. Inserting a vector of
//! the wrong dimensionality fails with `dimension_mismatch`.

pub mod binary;
pub mod centroid;
pub mod hnsw;
pub mod ivf;
pub mod pq;
pub mod quantized;

pub use binary::BinaryIndex;
pub use centroid::CentroidIndex;
pub use hnsw::HnswIndex;
pub use ivf::IvfIndex;
pub use pq::PqIndex;
pub use quantized::QuantizedIndex;

use serde::Serialize;

use crate::config::Config;
use crate::error::{LatticeError, Result};
use crate::models::Candidate;

/// Options recognized by `find_candidates`.
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub limit: u32,
    pub min_similarity: f32,
    pub shard_limit: Option<u32>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            min_similarity: 0.0,
            shard_limit: None,
        }
    }
}

impl FindOptions {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// One entry of a batch insert: `(id, metadata, embedding)`.
pub type IndexEntry = (String, serde_json::Value, Vec<f32>);

/// Strategy statistics exposed through `get_stats` and `/api/metrics`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StrategyStats {
    pub strategy: String,
    pub doc_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f32>,
}

/// The active index, one variant per strategy.
#[derive(Debug)]
pub enum IndexStrategy {
    Centroid(CentroidIndex),
    Quantized(QuantizedIndex),
    Hnsw(HnswIndex),
    Binary(BinaryIndex),
    Ivf(IvfIndex),
    Pq(PqIndex),
}

impl IndexStrategy {
    /// Construct a strategy by name. Unknown names fail with
    /// `unknown_strategy`.
    pub async fn create(name: &str, config: &Config) -> Result<Self> {
        let dim = config.embedding_dim;
        let idx = &config.index;
        match name {
            "centroid" => Ok(Self::Centroid(CentroidIndex::new(
                dim,
                idx.max_shard_size,
                idx.split_threshold,
            ))),
            "quantized" => Ok(Self::Quantized(
                QuantizedIndex::open(
                    dim,
                    idx.bins,
                    idx.dims_per_level,
                    idx.cell_capacity,
                    idx.search_radius,
                    config.quantized_root(),
                )
                .await?,
            )),
            "hnsw" => Ok(Self::Hnsw(HnswIndex::new(
                dim,
                idx.hnsw_m,
                idx.ef_construction,
                idx.ef_search,
            ))),
            "binary" => Ok(Self::Binary(BinaryIndex::new(
                dim,
                idx.binary_bits,
                &idx.binary_mode,
                idx.training_size,
            )?)),
            "ivf" => Ok(Self::Ivf(IvfIndex::new(
                dim,
                idx.n_lists,
                idx.n_probe,
                idx.training_size,
            ))),
            "pq" => Ok(Self::Pq(PqIndex::new(
                dim,
                idx.pq_m,
                idx.pq_k,
                idx.training_size,
            )?)),
            other => Err(LatticeError::UnknownStrategy(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Centroid(_) => "centroid",
            Self::Quantized(_) => "quantized",
            Self::Hnsw(_) => "hnsw",
            Self::Binary(_) => "binary",
            Self::Ivf(_) => "ivf",
            Self::Pq(_) => "pq",
        }
    }

    /// Index one document embedding under `id`.
    pub async fn index_document(
        &mut self,
        id: &str,
        metadata: serde_json::Value,
        embedding: &[f32],
    ) -> Result<()> {
        match self {
            Self::Centroid(s) => s.index_document(id, metadata, embedding),
            Self::Quantized(s) => s.index_document(id, metadata, embedding).await,
            Self::Hnsw(s) => s.index_document(id, metadata, embedding),
            Self::Binary(s) => s.index_document(id, metadata, embedding),
            Self::Ivf(s) => s.index_document(id, metadata, embedding),
            Self::Pq(s) => s.index_document(id, metadata, embedding),
        }
    }

    /// Index a batch. Strategies with per-batch state updates override the
    /// default fold.
    pub async fn index_batch(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        match self {
            Self::Binary(s) => s.index_batch(entries),
            _ => {
                for (id, metadata, embedding) in entries {
                    self.index_document(&id, metadata, &embedding).await?;
                }
                Ok(())
            }
        }
    }

    /// Remove a document. Unknown ids are a successful no-op.
    pub async fn delete_document(&mut self, id: &str) -> Result<()> {
        match self {
            Self::Centroid(s) => s.delete_document(id),
            Self::Quantized(s) => s.delete_document(id).await,
            Self::Hnsw(s) => s.delete_document(id),
            Self::Binary(s) => s.delete_document(id),
            Self::Ivf(s) => s.delete_document(id),
            Self::Pq(s) => s.delete_document(id),
        }
    }

    /// Approximate nearest neighbors of `query`, best first.
    pub async fn find_candidates(
        &self,
        query: &[f32],
        opts: &FindOptions,
    ) -> Result<Vec<Candidate>> {
        match self {
            Self::Centroid(s) => s.find_candidates(query, opts),
            Self::Quantized(s) => s.find_candidates(query, opts).await,
            Self::Hnsw(s) => s.find_candidates(query, opts),
            Self::Binary(s) => s.find_candidates(query, opts),
            Self::Ivf(s) => s.find_candidates(query, opts),
            Self::Pq(s) => s.find_candidates(query, opts),
        }
    }

    pub async fn get_stats(&self) -> StrategyStats {
        match self {
            Self::Centroid(s) => s.get_stats(),
            Self::Quantized(s) => s.get_stats().await,
            Self::Hnsw(s) => s.get_stats(),
            Self::Binary(s) => s.get_stats(),
            Self::Ivf(s) => s.get_stats(),
            Self::Pq(s) => s.get_stats(),
        }
    }

    /// Snapshot the strategy state.
    ///
    /// The quantized strategy is already durable through its cell files
    /// and reports `serialization_error` instead of duplicating them.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let encode = |value: serde_json::Result<Vec<u8>>| {
            value.map_err(|e| LatticeError::Serialization(e.to_string()))
        };
        match self {
            Self::Centroid(s) => encode(serde_json::to_vec(s)),
            Self::Hnsw(s) => encode(serde_json::to_vec(s)),
            Self::Binary(s) => encode(serde_json::to_vec(s)),
            Self::Ivf(s) => encode(serde_json::to_vec(s)),
            Self::Pq(s) => encode(serde_json::to_vec(s)),
            Self::Quantized(_) => Err(LatticeError::Serialization(
                "quantized strategy persists through its cell files".to_string(),
            )),
        }
    }

    /// Restore a strategy snapshot produced by [`serialize`](Self::serialize).
    pub fn deserialize(name: &str, bytes: &[u8]) -> Result<Self> {
        let decode_err = |e: serde_json::Error| LatticeError::Serialization(e.to_string());
        match name {
            "centroid" => Ok(Self::Centroid(
                serde_json::from_slice(bytes).map_err(decode_err)?,
            )),
            "hnsw" => Ok(Self::Hnsw(
                serde_json::from_slice(bytes).map_err(decode_err)?,
            )),
            "binary" => Ok(Self::Binary(
                serde_json::from_slice(bytes).map_err(decode_err)?,
            )),
            "ivf" => Ok(Self::Ivf(
                serde_json::from_slice(bytes).map_err(decode_err)?,
            )),
            "pq" => Ok(Self::Pq(
                serde_json::from_slice(bytes).map_err(decode_err)?,
            )),
            "quantized" => Err(LatticeError::Serialization(
                "quantized strategy persists through its cell files".to_string(),
            )),
            other => Err(LatticeError::UnknownStrategy(other.to_string())),
        }
    }

    /// Housekeeping pass: compact lists, retrain thresholds where cheap.
    pub async fn optimize(&mut self) -> Result<()> {
        match self {
            Self::Ivf(s) => s.optimize(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_unknown_strategy() {
        let config = Config::default();
        let err = IndexStrategy::create("flat", &config).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_strategy");
    }

    #[tokio::test]
    async fn test_factory_names_round_trip() {
        let config = Config {
            embedding_dim: 8,
            ..Config::default()
        };
        for name in ["centroid", "hnsw", "binary", "ivf", "pq"] {
            let strategy = IndexStrategy::create(name, &config).await.unwrap();
            assert_eq!(strategy.name(), name);
        }
    }

    #[tokio::test]
    async fn test_serialize_round_trip_preserves_results() {
        let config = Config {
            embedding_dim: 4,
            ..Config::default()
        };
        for name in ["centroid", "hnsw", "binary", "ivf", "pq"] {
            let mut strategy = IndexStrategy::create(name, &config).await.unwrap();
            strategy
                .index_document("a", serde_json::Value::Null, &[0.1, 0.2, 0.3, 0.4])
                .await
                .unwrap();
            strategy
                .index_document("b", serde_json::Value::Null, &[0.4, 0.3, 0.2, 0.1])
                .await
                .unwrap();

            let bytes = strategy.serialize().unwrap();
            let restored = IndexStrategy::deserialize(name, &bytes).unwrap();

            let opts = FindOptions::with_limit(2);
            let before = strategy
                .find_candidates(&[0.1, 0.2, 0.3, 0.4], &opts)
                .await
                .unwrap();
            let after = restored
                .find_candidates(&[0.1, 0.2, 0.3, 0.4], &opts)
                .await
                .unwrap();

            let ids = |cands: &[crate::models::Candidate]| {
                cands.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
            };
            assert_eq!(ids(&before), ids(&after), "strategy {name}");
        }
    }

    #[tokio::test]
    async fn test_universal_insert_then_find() {
        let config = Config {
            embedding_dim: 4,
            ..Config::default()
        };
        for name in ["centroid", "hnsw", "binary", "ivf", "pq"] {
            let mut strategy = IndexStrategy::create(name, &config).await.unwrap();
            strategy
                .index_document("target", serde_json::Value::Null, &[0.9, 0.1, 0.2, 0.3])
                .await
                .unwrap();
            let found = strategy
                .find_candidates(&[0.9, 0.1, 0.2, 0.3], &FindOptions::with_limit(1))
                .await
                .unwrap();
            assert_eq!(found[0].id, "target", "strategy {name}");
        }
    }

    #[tokio::test]
    async fn test_universal_idempotent_delete() {
        let config = Config {
            embedding_dim: 4,
            ..Config::default()
        };
        for name in ["centroid", "hnsw", "binary", "ivf", "pq"] {
            let mut strategy = IndexStrategy::create(name, &config).await.unwrap();
            strategy
                .index_document("x", serde_json::Value::Null, &[1.0, 0.0, 0.0, 0.0])
                .await
                .unwrap();
            strategy.delete_document("x").await.unwrap();
            strategy.delete_document("x").await.unwrap();
            strategy.delete_document("never-existed").await.unwrap();
            let found = strategy
                .find_candidates(&[1.0, 0.0, 0.0, 0.0], &FindOptions::default())
                .await
                .unwrap();
            assert!(found.is_empty(), "strategy {name}");
        }
    }

    #[tokio::test]
    async fn test_universal_dimension_mismatch() {
        let config = Config {
            embedding_dim: 4,
            ..Config::default()
        };
        for name in ["centroid", "hnsw", "binary", "ivf", "pq"] {
            let mut strategy = IndexStrategy::create(name, &config).await.unwrap();
            let err = strategy
                .index_document("bad", serde_json::Value::Null, &[1.0, 2.0])
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "dimension_mismatch", "strategy {name}");
        }
    }
}
