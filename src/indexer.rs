//! Indexing pipeline: chunk → embed → strategy + router → shard store.
//!
//! A document insert is atomic: the shard row set commits in one
//! transaction, and a strategy failure after the commit rolls the rows
//! back before surfacing the error. A duplicate id is an update, so the
//! old rows, strategy entries, and router counts go first. Batch indexing
//! embeds every chunk of every document in one provider call.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::EmbeddingCache;
use crate::chunk::chunk_document;
use crate::config::Config;
use crate::error::{LatticeError, Result};
use crate::models::{Chunk, Document, IndexReceipt};
use crate::router::ShardRouter;
use crate::store::BloomFilterManager;
use crate::strategy::{IndexEntry, IndexStrategy};

pub struct Indexer {
    config: Arc<Config>,
    strategy: Arc<RwLock<IndexStrategy>>,
    router: Arc<ShardRouter>,
    embed_cache: Arc<EmbeddingCache>,
    blooms: Arc<BloomFilterManager>,
}

impl Indexer {
    pub fn new(
        config: Arc<Config>,
        strategy: Arc<RwLock<IndexStrategy>>,
        router: Arc<ShardRouter>,
        embed_cache: Arc<EmbeddingCache>,
        blooms: Arc<BloomFilterManager>,
    ) -> Self {
        Self {
            config,
            strategy,
            router,
            embed_cache,
            blooms,
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.config.query.index_timeout_ms)
    }

    /// Index one document under the indexing deadline.
    pub async fn index_document(&self, doc: Document) -> Result<IndexReceipt> {
        match tokio::time::timeout(self.deadline(), self.index_inner(doc)).await {
            Ok(result) => result,
            Err(_) => Err(LatticeError::Timeout(self.deadline())),
        }
    }

    async fn index_inner(&self, doc: Document) -> Result<IndexReceipt> {
        if doc.id.trim().is_empty() {
            return Err(LatticeError::InvalidInput("document id must not be empty".into()));
        }

        // Duplicate id is an update: clear the previous generation first.
        if self.router.find_document_shard(&doc.id).await?.is_some() {
            self.delete_inner(&doc.id).await?;
        }

        let chunks = self.embed_chunks(&doc).await?;
        let doc_embedding = chunks
            .iter()
            .find(|c| c.id == doc.id)
            .and_then(|c| c.embedding.clone())
            .ok_or_else(|| {
                LatticeError::InvalidInput("document produced no embeddable chunks".into())
            })?;

        let shard = self.router.route_insert(&doc_embedding).await?;
        let writer = self.router.writer_for(&shard).await?;
        writer.insert(doc.clone(), chunks.clone()).await?;

        if let Err(e) = self.index_into_strategy(&doc, &chunks).await {
            // Keep the shard consistent with the strategy: undo the rows.
            if let Err(rollback) = writer.delete(&doc.id).await {
                warn!(doc = %doc.id, error = %rollback, "rollback after strategy failure failed");
            }
            return Err(e);
        }

        self.router.note_insert(&shard.id, &doc_embedding).await?;
        self.blooms.insert(&shard.id, &doc.id);
        info!(doc = %doc.id, shard = %shard.id, chunks = chunks.len(), "indexed document");

        Ok(IndexReceipt {
            id: doc.id,
            shard_id: shard.id,
            status: "indexed".to_string(),
        })
    }

    async fn embed_chunks(&self, doc: &Document) -> Result<Vec<Chunk>> {
        let mut chunks = chunk_document(doc);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self
            .embed_cache
            .get_or_compute_batch(&self.config.embedding, self.config.embedding_dim, &texts)
            .await?;
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = Some(embedding);
        }
        Ok(chunks)
    }

    async fn index_into_strategy(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut inserted: Vec<String> = Vec::new();
        let mut strategy = self.strategy.write().await;
        for chunk in chunks {
            let Some(embedding) = &chunk.embedding else {
                continue;
            };
            let metadata = chunk_metadata(doc, chunk);
            if let Err(e) = strategy.index_document(&chunk.id, metadata, embedding).await {
                for id in &inserted {
                    let _ = strategy.delete_document(id).await;
                }
                return Err(e);
            }
            inserted.push(chunk.id.clone());
        }
        Ok(())
    }

    /// Batch indexing: every chunk of every document embedded in one
    /// provider call, strategy fed through `index_batch`.
    pub async fn index_documents(&self, docs: Vec<Document>) -> Result<Vec<IndexReceipt>> {
        let work = async {
            let mut receipts = Vec::with_capacity(docs.len());

            // Warm the embedding cache with one batched call.
            let mut all_texts: Vec<String> = Vec::new();
            for doc in &docs {
                for chunk in chunk_document(doc) {
                    all_texts.push(chunk.text);
                }
            }
            self.embed_cache
                .get_or_compute_batch(&self.config.embedding, self.config.embedding_dim, &all_texts)
                .await?;

            for doc in docs {
                if self.router.find_document_shard(&doc.id).await?.is_some() {
                    self.delete_inner(&doc.id).await?;
                }

                let chunks = self.embed_chunks(&doc).await?;
                let doc_embedding = chunks
                    .iter()
                    .find(|c| c.id == doc.id)
                    .and_then(|c| c.embedding.clone())
                    .ok_or_else(|| {
                        LatticeError::InvalidInput(
                            "document produced no embeddable chunks".into(),
                        )
                    })?;

                let shard = self.router.route_insert(&doc_embedding).await?;
                let writer = self.router.writer_for(&shard).await?;
                writer.insert(doc.clone(), chunks.clone()).await?;

                let entries: Vec<IndexEntry> = chunks
                    .iter()
                    .filter_map(|c| {
                        c.embedding
                            .clone()
                            .map(|e| (c.id.clone(), chunk_metadata(&doc, c), e))
                    })
                    .collect();
                {
                    let mut strategy = self.strategy.write().await;
                    if let Err(e) = strategy.index_batch(entries).await {
                        if let Err(rollback) = writer.delete(&doc.id).await {
                            warn!(doc = %doc.id, error = %rollback, "batch rollback failed");
                        }
                        return Err(e);
                    }
                }

                self.router.note_insert(&shard.id, &doc_embedding).await?;
                self.blooms.insert(&shard.id, &doc.id);
                receipts.push(IndexReceipt {
                    id: doc.id,
                    shard_id: shard.id,
                    status: "indexed".to_string(),
                });
            }
            Ok(receipts)
        };

        match tokio::time::timeout(self.deadline(), work).await {
            Ok(result) => result,
            Err(_) => Err(LatticeError::Timeout(self.deadline())),
        }
    }

    /// Delete a document everywhere. Unknown ids succeed as a no-op.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        match tokio::time::timeout(self.deadline(), self.delete_inner(id)).await {
            Ok(result) => result,
            Err(_) => Err(LatticeError::Timeout(self.deadline())),
        }
    }

    async fn delete_inner(&self, id: &str) -> Result<bool> {
        let Some(shard) = self.router.find_document_shard(id).await? else {
            return Ok(false);
        };

        let store = self.router.store_for(&shard).await?;
        let doc_embedding = store.chunk_embedding(id).await?;

        let writer = self.router.writer_for(&shard).await?;
        let chunk_ids = writer.delete(id).await?;

        {
            let mut strategy = self.strategy.write().await;
            for chunk_id in &chunk_ids {
                strategy.delete_document(chunk_id).await?;
            }
        }

        self.router
            .note_delete(&shard.id, doc_embedding.as_deref())
            .await?;
        info!(doc = %id, shard = %shard.id, "deleted document");
        Ok(true)
    }
}

/// Strategy-side metadata for one chunk: the document metadata plus the
/// linkage fields scorers and grounding need.
fn chunk_metadata(doc: &Document, chunk: &Chunk) -> serde_json::Value {
    let mut value = match &doc.metadata {
        serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
        _ => serde_json::json!({}),
    };
    if let Some(map) = value.as_object_mut() {
        map.insert("doc_id".to_string(), serde_json::json!(chunk.doc_id));
        map.insert("level".to_string(), serde_json::json!(chunk.level.as_str()));
    }
    value
}
