//! Configuration loading and validation.
//!
//! Lattice is configured from the environment, with an optional TOML file
//! for the long tail of tuning knobs. Environment variables win over the
//! file. Recognized variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `STORAGE_PATH` | Root directory for shard and cell databases | `./data` |
//! | `ROUTING_DB_PATH` | SQLite file holding the shard table | `{storage}/routing.db` |
//! | `EMBEDDING_DIM` | Vector dimensionality `D` | `384` |
//! | `INDEX_STRATEGY` | `centroid`, `quantized`, `hnsw`, `binary`, `ivf`, `pq` | `centroid` |
//! | `MIN_SIMILARITY` | Query-level similarity floor | `0.0` |
//! | `PORT` | HTTP listen port | `4040` |
//!
//! Configuration is read-only after start; every component receives it
//! through an `Arc<Config>` handle.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub storage_path: PathBuf,
    pub routing_db_path: Option<PathBuf>,
    pub embedding_dim: usize,
    pub index_strategy: String,
    pub min_similarity: f32,
    pub port: u16,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub index: IndexConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data"),
            routing_db_path: None,
            embedding_dim: 384,
            index_strategy: "centroid".to_string(),
            min_similarity: 0.0,
            port: 4040,
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            query: QueryConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hashed`, `http`, or `disabled`.
    pub provider: String,
    pub model: Option<String>,
    /// Endpoint for the `http` provider.
    pub endpoint: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashed".to_string(),
            model: None,
            endpoint: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Embedding cache entries.
    pub embedding_capacity: usize,
    /// Embedding cache TTL in seconds; 0 means entries never expire.
    pub embedding_ttl_secs: u64,
    /// Request cache entries.
    pub request_capacity: usize,
    /// Request cache TTL in seconds.
    pub request_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            embedding_capacity: 10_000,
            embedding_ttl_secs: 0,
            request_capacity: 1_000,
            request_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    /// Per-shard candidate gather deadline.
    pub shard_timeout_ms: u64,
    /// Federated SQL fan-out deadline.
    pub federated_timeout_ms: u64,
    /// Indexing deadline per document batch.
    pub index_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            shard_timeout_ms: 5_000,
            federated_timeout_ms: 30_000,
            index_timeout_ms: 30_000,
        }
    }
}

/// Per-strategy tuning knobs, all optional.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    // centroid
    pub max_shard_size: usize,
    pub split_threshold: f32,
    // quantized
    pub bins: usize,
    pub dims_per_level: usize,
    pub cell_capacity: usize,
    pub search_radius: i64,
    // hnsw
    pub hnsw_m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    // binary
    pub binary_bits: usize,
    pub binary_mode: String,
    // ivf
    pub n_lists: usize,
    pub n_probe: usize,
    // pq
    pub pq_m: usize,
    pub pq_k: usize,
    // ivf + pq + binary(learned)
    pub training_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_shard_size: 10_000,
            split_threshold: 0.5,
            bins: 8,
            dims_per_level: 2,
            cell_capacity: 1_000,
            search_radius: 1,
            hnsw_m: 16,
            ef_construction: 200,
            ef_search: 50,
            binary_bits: 256,
            binary_mode: "mean".to_string(),
            n_lists: 16,
            n_probe: 4,
            pq_m: 8,
            pq_k: 256,
            training_size: 1_000,
        }
    }
}

impl Config {
    /// Load configuration: optional TOML file, then environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("STORAGE_PATH") {
            self.storage_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROUTING_DB_PATH") {
            self.routing_db_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("EMBEDDING_DIM") {
            self.embedding_dim = v
                .parse()
                .with_context(|| format!("EMBEDDING_DIM is not a number: {v}"))?;
        }
        if let Ok(v) = std::env::var("INDEX_STRATEGY") {
            self.index_strategy = v;
        }
        if let Ok(v) = std::env::var("MIN_SIMILARITY") {
            self.min_similarity = v
                .parse()
                .with_context(|| format!("MIN_SIMILARITY is not a number: {v}"))?;
        }
        if let Ok(v) = std::env::var("PORT") {
            self.port = v
                .parse()
                .with_context(|| format!("PORT is not a number: {v}"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            anyhow::bail!("embedding_dim must be positive");
        }
        const STRATEGIES: [&str; 6] = ["centroid", "quantized", "hnsw", "binary", "ivf", "pq"];
        if !STRATEGIES.contains(&self.index_strategy.as_str()) {
            anyhow::bail!(
                "Unknown index strategy: '{}'. Available: {}",
                self.index_strategy,
                STRATEGIES.join(", ")
            );
        }
        if !(0.0..=1.0).contains(&self.min_similarity) {
            anyhow::bail!("min_similarity must be in [0, 1]");
        }
        if self.index.pq_k > 256 {
            anyhow::bail!("pq_k must be at most 256 (codes are single bytes)");
        }
        if self.index.bins == 0 || self.index.dims_per_level == 0 {
            anyhow::bail!("bins and dims_per_level must be positive");
        }
        Ok(())
    }

    /// Path of the routing database (defaults to `{storage}/routing.db`).
    pub fn routing_db(&self) -> PathBuf {
        self.routing_db_path
            .clone()
            .unwrap_or_else(|| self.storage_path.join("routing.db"))
    }

    /// Directory holding quantized cells.
    pub fn quantized_root(&self) -> PathBuf {
        self.storage_path.join("quantized")
    }

    /// Directory holding strategy snapshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.storage_path.join("snapshots")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 4040);
        assert_eq!(config.index_strategy, "centroid");
        assert_eq!(config.index.hnsw_m, 16);
        assert_eq!(config.index.ef_construction, 200);
        assert_eq!(config.index.ef_search, 50);
    }

    #[test]
    fn test_validate_rejects_unknown_strategy() {
        let config = Config {
            index_strategy: "flat".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_pq_k() {
        let mut config = Config::default();
        config.index.pq_k = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_routing_db_default_under_storage() {
        let config = Config {
            storage_path: PathBuf::from("/tmp/lattice"),
            ..Config::default()
        };
        assert_eq!(config.routing_db(), PathBuf::from("/tmp/lattice/routing.db"));
    }

    #[test]
    fn test_toml_round_trip() {
        let raw = r#"
            storage_path = "/var/lattice"
            embedding_dim = 8
            index_strategy = "hnsw"

            [index]
            hnsw_m = 4
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.embedding_dim, 8);
        assert_eq!(config.index.hnsw_m, 4);
        // unset fields keep defaults
        assert_eq!(config.index.ef_search, 50);
    }
}
