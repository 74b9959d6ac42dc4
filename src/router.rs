//! Shard router: centroid-based placement and query routing.
//!
//! The router owns the shard table, persisted in its own SQLite database
//! (`ROUTING_DB_PATH`) and mirrored in memory behind a single write lock.
//! Placement follows the centroid rules: a document goes to the open
//! shard whose centroid is closest by cosine, unless every candidate is
//! full or below the split threshold, in which case a new shard seeds at
//! the document's vector. Centroids move by incremental mean on every
//! insert and delete, atomically with the counter update; the periodic
//! maintenance pass recomputes them from stored vectors to cancel drift.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{LatticeError, Result};
use crate::kernels::distance::{cosine, norm};
use crate::kernels::kmeans::kmeans;
use crate::models::ShardInfo;
use crate::store::{BloomFilterManager, ConnectionPool, ShardStore, ShardWriter};

pub struct ShardRouter {
    config: Arc<Config>,
    pools: Arc<ConnectionPool>,
    blooms: Arc<BloomFilterManager>,
    routing: sqlx::SqlitePool,
    shards: RwLock<Vec<ShardInfo>>,
    writers: RwLock<HashMap<String, ShardWriter>>,
}

impl ShardRouter {
    /// Open the routing database, load the live shard table, and warm the
    /// per-shard bloom filters.
    pub async fn open(
        config: Arc<Config>,
        pools: Arc<ConnectionPool>,
        blooms: Arc<BloomFilterManager>,
    ) -> Result<Self> {
        let routing = pools.checkout(&config.routing_db()).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shards (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                doc_count INTEGER NOT NULL DEFAULT 0,
                query_count INTEGER NOT NULL DEFAULT 0,
                centroid BLOB NOT NULL,
                centroid_norm REAL NOT NULL DEFAULT 0,
                tombstoned INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&routing)
        .await?;

        let rows = sqlx::query_as::<_, (String, String, i64, i64, Vec<u8>, f64)>(
            "SELECT id, path, doc_count, query_count, centroid, centroid_norm FROM shards WHERE tombstoned = 0",
        )
        .fetch_all(&routing)
        .await?;

        let shards: Vec<ShardInfo> = rows
            .into_iter()
            .map(|(id, path, doc_count, query_count, centroid, centroid_norm)| ShardInfo {
                id,
                path,
                doc_count,
                query_count,
                centroid: blob_to_vec(&centroid),
                centroid_norm: centroid_norm as f32,
            })
            .collect();

        let router = Self {
            config,
            pools,
            blooms,
            routing,
            shards: RwLock::new(shards),
            writers: RwLock::new(HashMap::new()),
        };

        // Warm the bloom filters; a shard that fails to open degrades to
        // no-claim lookups instead of blocking startup.
        for shard in router.shards.read().await.clone() {
            match router.store_for(&shard).await {
                Ok(store) => {
                    let ids = store.document_ids().await?;
                    router.blooms.rebuild(&shard.id, &ids);
                }
                Err(e) => warn!(shard = %shard.id, error = %e, "bloom warm-up skipped"),
            }
        }

        Ok(router)
    }

    /// Storage handle for a shard (schema ensured).
    pub async fn store_for(&self, shard: &ShardInfo) -> Result<ShardStore> {
        let pool = self.pools.checkout(&PathBuf::from(&shard.path)).await?;
        ShardStore::open(pool).await
    }

    /// Single-writer handle for a shard, spawned on first use.
    pub async fn writer_for(&self, shard: &ShardInfo) -> Result<ShardWriter> {
        if let Some(writer) = self.writers.read().await.get(&shard.id) {
            return Ok(writer.clone());
        }
        let mut writers = self.writers.write().await;
        if let Some(writer) = writers.get(&shard.id) {
            return Ok(writer.clone());
        }
        let writer = ShardWriter::spawn(self.store_for(shard).await?);
        writers.insert(shard.id.clone(), writer.clone());
        Ok(writer)
    }

    /// Shard that should receive a document with this embedding,
    /// creating a new one when the placement rules demand it.
    pub async fn route_insert(&self, embedding: &[f32]) -> Result<ShardInfo> {
        LatticeError::check_dim(self.config.embedding_dim, embedding)?;

        let best = {
            let shards = self.shards.read().await;
            shards
                .iter()
                .filter(|s| (s.doc_count as usize) < self.config.index.max_shard_size)
                .map(|s| (s.clone(), cosine(embedding, &s.centroid)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        };

        match best {
            Some((shard, sim)) if sim >= self.config.index.split_threshold => Ok(shard),
            _ => self.create_shard(embedding).await,
        }
    }

    async fn create_shard(&self, seed: &[f32]) -> Result<ShardInfo> {
        let id = format!("shard-{}", Uuid::new_v4().simple());
        let path = self
            .config
            .storage_path
            .join(&id)
            .join("shard.db")
            .to_string_lossy()
            .to_string();

        let shard = ShardInfo {
            id: id.clone(),
            path,
            doc_count: 0,
            query_count: 0,
            centroid: seed.to_vec(),
            centroid_norm: norm(seed),
        };

        // Create the database file and schema eagerly so a shard is
        // queryable the moment it is routable.
        self.store_for(&shard).await?;

        sqlx::query(
            "INSERT INTO shards (id, path, doc_count, query_count, centroid, centroid_norm) VALUES (?, ?, 0, 0, ?, ?)",
        )
        .bind(&shard.id)
        .bind(&shard.path)
        .bind(vec_to_blob(&shard.centroid))
        .bind(shard.centroid_norm as f64)
        .execute(&self.routing)
        .await?;

        self.shards.write().await.push(shard.clone());
        self.blooms.rebuild(&shard.id, &[]);
        info!(shard = %shard.id, "created shard");
        Ok(shard)
    }

    /// Fold a newly inserted document vector into the shard's centroid
    /// and counter, persisting both together.
    pub async fn note_insert(&self, shard_id: &str, embedding: &[f32]) -> Result<()> {
        let mut shards = self.shards.write().await;
        let shard = shards
            .iter_mut()
            .find(|s| s.id == shard_id)
            .ok_or_else(|| LatticeError::ShardUnavailable(shard_id.to_string()))?;

        let n = (shard.doc_count + 1) as f32;
        for (c, x) in shard.centroid.iter_mut().zip(embedding.iter()) {
            *c += (x - *c) / n;
        }
        shard.centroid_norm = norm(&shard.centroid);
        shard.doc_count += 1;

        self.persist(shard).await
    }

    /// Reverse [`note_insert`] for a deleted document.
    pub async fn note_delete(&self, shard_id: &str, embedding: Option<&[f32]>) -> Result<()> {
        let mut shards = self.shards.write().await;
        let shard = shards
            .iter_mut()
            .find(|s| s.id == shard_id)
            .ok_or_else(|| LatticeError::ShardUnavailable(shard_id.to_string()))?;

        let n = shard.doc_count;
        shard.doc_count = (shard.doc_count - 1).max(0);
        if let Some(v) = embedding {
            if shard.doc_count == 0 {
                shard.centroid = vec![0.0; shard.centroid.len()];
            } else {
                // mean' = (mean·n − v) / (n − 1)
                for (c, x) in shard.centroid.iter_mut().zip(v.iter()) {
                    *c = (*c * n as f32 - x) / shard.doc_count as f32;
                }
            }
            shard.centroid_norm = norm(&shard.centroid);
        }

        self.persist(shard).await
    }

    async fn persist(&self, shard: &ShardInfo) -> Result<()> {
        sqlx::query(
            "UPDATE shards SET doc_count = ?, query_count = ?, centroid = ?, centroid_norm = ? WHERE id = ?",
        )
        .bind(shard.doc_count)
        .bind(shard.query_count)
        .bind(vec_to_blob(&shard.centroid))
        .bind(shard.centroid_norm as f64)
        .bind(&shard.id)
        .execute(&self.routing)
        .await?;
        Ok(())
    }

    /// Shards to probe for a query, descending by centroid cosine,
    /// truncated to `shard_limit` (default `log2(#shards) + 1`).
    pub async fn route_query(
        &self,
        embedding: &[f32],
        shard_limit: Option<u32>,
    ) -> Result<Vec<ShardInfo>> {
        LatticeError::check_dim(self.config.embedding_dim, embedding)?;
        let shards = self.shards.read().await;
        if shards.is_empty() {
            return Ok(Vec::new());
        }

        let default_probes = ((shards.len() as f32).log2().floor() as usize) + 1;
        let probes = shard_limit.map(|k| k as usize).unwrap_or(default_probes).max(1);

        let mut ranked: Vec<(ShardInfo, f32)> = shards
            .iter()
            .map(|s| (s.clone(), cosine(embedding, &s.centroid)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(probes);
        Ok(ranked.into_iter().map(|(s, _)| s).collect())
    }

    /// Bump a shard's query counter (fire-and-forget persistence).
    pub async fn record_query(&self, shard_id: &str) {
        let mut shards = self.shards.write().await;
        if let Some(shard) = shards.iter_mut().find(|s| s.id == shard_id) {
            shard.query_count += 1;
            let _ = self.persist(shard).await;
        }
    }

    pub async fn list_all_shards(&self) -> Vec<ShardInfo> {
        self.shards.read().await.clone()
    }

    pub async fn shard_count(&self) -> usize {
        self.shards.read().await.len()
    }

    /// Locate the shard holding a document, bloom filters first.
    pub async fn find_document_shard(&self, doc_id: &str) -> Result<Option<ShardInfo>> {
        let shards = self.list_all_shards().await;
        for shard in shards {
            if !self.blooms.maybe_contains(&shard.id, doc_id) {
                continue;
            }
            let store = self.store_for(&shard).await?;
            if store.contains_document(doc_id).await? {
                return Ok(Some(shard));
            }
        }
        Ok(None)
    }

    /// Split every shard holding more than `2 × target` documents into
    /// two k-means halves, then tombstone the original.
    pub async fn rebalance(&self, target: usize) -> Result<usize> {
        let oversized: Vec<ShardInfo> = self
            .list_all_shards()
            .await
            .into_iter()
            .filter(|s| s.doc_count as usize > 2 * target.max(1))
            .collect();

        let mut splits = 0;
        for shard in oversized {
            self.split_shard(&shard).await?;
            splits += 1;
        }
        Ok(splits)
    }

    async fn split_shard(&self, shard: &ShardInfo) -> Result<()> {
        let store = self.store_for(shard).await?;
        let doc_vectors = store.document_embeddings().await?;
        if doc_vectors.len() < 2 {
            return Ok(());
        }

        let vectors: Vec<Vec<f32>> = doc_vectors.iter().map(|(_, v)| v.clone()).collect();
        let mut rng = rand::thread_rng();
        let clustering = kmeans(&vectors, 2, &mut rng);

        let halves = [
            self.create_shard(&clustering.centroids[0]).await?,
            self.create_shard(&clustering.centroids[1]).await?,
        ];

        for ((chunk_id, _), &cluster) in doc_vectors.iter().zip(clustering.assignments.iter()) {
            // Document-level chunk ids are the document ids themselves.
            let doc_id = chunk_id;
            let Some(doc) = store.get_document(doc_id).await? else {
                warn!(doc = %doc_id, "document missing during rebalance");
                continue;
            };
            let chunks = store.document_chunks(doc_id).await?;
            let doc_embedding = chunks
                .iter()
                .find(|c| c.id == *doc_id)
                .and_then(|c| c.embedding.clone());

            let dest = &halves[cluster];
            let writer = self.writer_for(dest).await?;
            writer.insert(doc.clone(), chunks).await?;
            self.blooms.insert(&dest.id, doc_id);
            if let Some(v) = doc_embedding {
                self.note_insert(&dest.id, &v).await?;
            }
        }

        self.tombstone(shard).await
    }

    async fn tombstone(&self, shard: &ShardInfo) -> Result<()> {
        sqlx::query("UPDATE shards SET tombstoned = 1 WHERE id = ?")
            .bind(&shard.id)
            .execute(&self.routing)
            .await?;
        self.shards.write().await.retain(|s| s.id != shard.id);
        self.writers.write().await.remove(&shard.id);
        self.blooms.drop_shard(&shard.id);
        self.pools.evict(&PathBuf::from(&shard.path)).await;
        info!(shard = %shard.id, "tombstoned shard");
        Ok(())
    }

    /// Recompute every centroid from ground-truth stored vectors.
    pub async fn recompute_centroids(&self) -> Result<()> {
        let shards = self.list_all_shards().await;
        for shard in shards {
            let store = self.store_for(&shard).await?;
            let doc_vectors = store.document_embeddings().await?;
            let doc_count = store.document_count().await?;

            let mut locked = self.shards.write().await;
            let Some(live) = locked.iter_mut().find(|s| s.id == shard.id) else {
                continue;
            };
            live.doc_count = doc_count;
            if !doc_vectors.is_empty() {
                let dim = doc_vectors[0].1.len();
                let mut mean = vec![0.0f32; dim];
                for (_, v) in &doc_vectors {
                    for (m, x) in mean.iter_mut().zip(v.iter()) {
                        *m += x;
                    }
                }
                for m in mean.iter_mut() {
                    *m /= doc_vectors.len() as f32;
                }
                live.centroid_norm = norm(&mean);
                live.centroid = mean;
            }
            self.persist(live).await?;
        }
        Ok(())
    }

    /// Background drift-correction loop; never returns.
    pub async fn maintenance_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.recompute_centroids().await {
                warn!(error = %e, "centroid maintenance failed");
            } else {
                info!("centroid maintenance pass complete");
            }
        }
    }
}
