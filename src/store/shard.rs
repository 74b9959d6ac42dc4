//! Shard schema, transactional writes, and the single-writer actor.
//!
//! A document insert is atomic: the document row, its chunk rows, and
//! their embedding BLOBs all commit in one transaction or none do. Writes
//! are serialized through a [`ShardWriter`] task fed by an MPSC channel,
//! giving linearizable per-shard writes; reads go straight to the pool.

use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::Result;
use crate::kernels::distance::unit_similarity;
use crate::models::{Candidate, Chunk, ChunkLevel, Document};

/// Storage operations for one shard database.
#[derive(Clone)]
pub struct ShardStore {
    pool: SqlitePool,
}

impl ShardStore {
    /// Wrap a pool and make sure the schema exists.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                parent_id TEXT,
                level TEXT NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks (doc_id)")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vec_chunks (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a document with its chunk rows and embeddings,
    /// atomically inside `BEGIN IMMEDIATE … COMMIT`.
    ///
    /// sqlx's `Transaction` only issues a deferred `BEGIN` for SQLite, so
    /// the immediate-mode transaction is driven by hand: any statement
    /// failure triggers an explicit `ROLLBACK`.
    pub async fn insert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::insert_rows(&mut *conn, doc, chunks).await {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!(error = %rollback, "rollback failed after insert error");
                }
                Err(e)
            }
        }
    }

    async fn insert_rows(
        conn: &mut sqlx::SqliteConnection,
        doc: &Document,
        chunks: &[Chunk],
    ) -> Result<()> {
        sqlx::query("DELETE FROM vec_chunks WHERE id IN (SELECT id FROM chunks WHERE doc_id = ?)")
            .bind(&doc.id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(&doc.id)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, text, metadata) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                metadata = excluded.metadata
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.text)
        .bind(doc.metadata.to_string())
        .execute(&mut *conn)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, doc_id, parent_id, level, text, start_offset, end_offset)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.doc_id)
            .bind(&chunk.parent_id)
            .bind(chunk.level.as_str())
            .bind(&chunk.text)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .execute(&mut *conn)
            .await?;

            if let Some(embedding) = &chunk.embedding {
                sqlx::query("INSERT INTO vec_chunks (id, embedding) VALUES (?, ?)")
                    .bind(&chunk.id)
                    .bind(vec_to_blob(embedding))
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Delete a document and all derived rows inside `BEGIN IMMEDIATE`.
    /// Returns the removed chunk ids so the caller can drop them from the
    /// active strategy.
    pub async fn delete_document(&self, id: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::delete_rows(&mut *conn, id).await {
            Ok(chunk_ids) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(chunk_ids)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!(error = %rollback, "rollback failed after delete error");
                }
                Err(e)
            }
        }
    }

    async fn delete_rows(conn: &mut sqlx::SqliteConnection, id: &str) -> Result<Vec<String>> {
        let chunk_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE doc_id = ?")
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;

        sqlx::query("DELETE FROM vec_chunks WHERE id IN (SELECT id FROM chunks WHERE doc_id = ?)")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(chunk_ids)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT id, text, metadata FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            let metadata: String = r.get("metadata");
            Document {
                id: r.get("id"),
                text: r.get("text"),
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            }
        }))
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT id, doc_id, parent_id, level, text, start_offset, end_offset FROM chunks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let level: String = r.get("level");
            Chunk {
                id: r.get("id"),
                doc_id: r.get("doc_id"),
                parent_id: r.get("parent_id"),
                level: ChunkLevel::parse(&level).unwrap_or(ChunkLevel::Document),
                text: r.get("text"),
                start_offset: r.get::<i64, _>("start_offset") as usize,
                end_offset: r.get::<i64, _>("end_offset") as usize,
                embedding: None,
            }
        }))
    }

    /// Stored embedding of one chunk, if any.
    pub async fn chunk_embedding(&self, chunk_id: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM vec_chunks WHERE id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    pub async fn document_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT count(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn document_ids(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT id FROM documents")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn contains_document(&self, id: &str) -> Result<bool> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// All chunks of one document with their embeddings, ready to be
    /// re-inserted elsewhere (used by shard rebalancing).
    pub async fn document_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.doc_id, c.parent_id, c.level, c.text,
                   c.start_offset, c.end_offset, v.embedding
            FROM chunks c
            LEFT JOIN vec_chunks v ON v.id = c.id
            WHERE c.doc_id = ?
            ORDER BY c.start_offset ASC
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let level: String = r.get("level");
                let blob: Option<Vec<u8>> = r.get("embedding");
                Chunk {
                    id: r.get("id"),
                    doc_id: r.get("doc_id"),
                    parent_id: r.get("parent_id"),
                    level: ChunkLevel::parse(&level).unwrap_or(ChunkLevel::Document),
                    text: r.get("text"),
                    start_offset: r.get::<i64, _>("start_offset") as usize,
                    end_offset: r.get::<i64, _>("end_offset") as usize,
                    embedding: blob.map(|b| blob_to_vec(&b)),
                }
            })
            .collect())
    }

    /// Every stored embedding in this shard, for centroid recomputation
    /// and rebalancing.
    pub async fn all_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let rows = sqlx::query("SELECT id, embedding FROM vec_chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let blob: Vec<u8> = r.get("embedding");
                (r.get("id"), blob_to_vec(&blob))
            })
            .collect())
    }

    /// Embeddings of document-level chunks only (one per document).
    pub async fn document_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
            SELECT v.id, v.embedding FROM vec_chunks v
            JOIN chunks c ON c.id = v.id
            WHERE c.level = 'document'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let blob: Vec<u8> = r.get("embedding");
                (r.get("id"), blob_to_vec(&blob))
            })
            .collect())
    }

    /// Exact cosine scan over this shard's vectors, best first.
    ///
    /// This is the ground-truth gather used by the centroid query path;
    /// candidates come back with chunk text and document id attached.
    pub async fn scan_vectors(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
        level: Option<ChunkLevel>,
    ) -> Result<Vec<Candidate>> {
        let rows = sqlx::query(
            r#"
            SELECT v.id, v.embedding, c.doc_id, c.level, c.text, d.metadata
            FROM vec_chunks v
            JOIN chunks c ON c.id = v.id
            JOIN documents d ON d.id = c.doc_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<Candidate> = rows
            .iter()
            .filter_map(|r| {
                let row_level: String = r.get("level");
                if let Some(want) = level {
                    if ChunkLevel::parse(&row_level) != Some(want) {
                        return None;
                    }
                }
                let blob: Vec<u8> = r.get("embedding");
                let vector = blob_to_vec(&blob);
                let similarity = unit_similarity(query, &vector);
                if similarity < min_similarity {
                    return None;
                }
                let metadata: String = r.get("metadata");
                let mut cand = Candidate::new(r.get::<String, _>("id"), similarity)
                    .with_metadata(
                        serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                    );
                cand.doc_id = Some(r.get("doc_id"));
                cand.text = Some(r.get("text"));
                Some(cand)
            })
            .collect();

        crate::models::sort_by_similarity(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }
}

enum WriteCommand {
    Insert {
        doc: Box<Document>,
        chunks: Vec<Chunk>,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
}

/// Handle to a shard's single-writer task.
///
/// All mutations funnel through one MPSC consumer, so two concurrent
/// inserts into the same shard can never interleave their transactions.
#[derive(Clone)]
pub struct ShardWriter {
    tx: mpsc::Sender<WriteCommand>,
}

impl ShardWriter {
    /// Spawn the writer task for `store`.
    pub fn spawn(store: ShardStore) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteCommand>(64);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriteCommand::Insert { doc, chunks, reply } => {
                        let result = store.insert_document(&doc, &chunks).await;
                        if reply.send(result).is_err() {
                            error!("shard writer: insert reply dropped");
                        }
                    }
                    WriteCommand::Delete { id, reply } => {
                        let result = store.delete_document(&id).await;
                        if reply.send(result).is_err() {
                            error!("shard writer: delete reply dropped");
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    pub async fn insert(&self, doc: Document, chunks: Vec<Chunk>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Insert {
                doc: Box::new(doc),
                chunks,
                reply,
            })
            .await
            .map_err(|_| crate::error::LatticeError::ShardUnavailable("writer gone".into()))?;
        rx.await
            .map_err(|_| crate::error::LatticeError::ShardUnavailable("writer gone".into()))?
    }

    pub async fn delete(&self, id: &str) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Delete {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| crate::error::LatticeError::ShardUnavailable("writer gone".into()))?;
        rx.await
            .map_err(|_| crate::error::LatticeError::ShardUnavailable("writer gone".into()))?
    }
}
