//! Query engine: the hot search path.
//!
//! `execute_query` runs the full pipeline: request cache → embedding
//! (through the embedding cache) → shard routing → concurrent per-shard
//! candidate gather under a deadline → optional SQL predicate filter →
//! ranking fusion → optional grounding → request cache store.
//!
//! Per-shard failures degrade to partial results with a warning; the
//! query only fails when every routed shard failed. A timed-out shard's
//! gather future is dropped and its contribution is the empty list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

use crate::cache::{EmbeddingCache, QueryCache};
use crate::config::Config;
use crate::error::{LatticeError, Result};
use crate::federated::FederatedExecutor;
use crate::models::{Candidate, ChunkLevel, Reference, ShardInfo};
use crate::ranking::{Ranker, ScoreContext};
use crate::router::ShardRouter;
use crate::strategy::{FindOptions, IndexStrategy};

/// Options accepted by [`QueryEngine::execute_query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<u32>,
    pub min_similarity: Option<f32>,
    pub shard_limit: Option<u32>,
    /// Restrict results to one chunk level (grounded search).
    pub level: Option<ChunkLevel>,
    /// Attach [`Reference`] provenance to each result.
    pub expand_context: bool,
    /// `"vector_search"` bypasses all non-vector scorers.
    pub force_engine: Option<String>,
    /// SQL predicate over the `documents` table (hybrid search).
    pub where_clause: Option<String>,
}

pub struct QueryEngine {
    config: Arc<Config>,
    strategy: Arc<RwLock<IndexStrategy>>,
    router: Arc<ShardRouter>,
    embed_cache: Arc<EmbeddingCache>,
    query_cache: Arc<QueryCache>,
    federated: FederatedExecutor,
    ranker: Ranker,
    vector_ranker: Ranker,
}

/// Heuristic for transparently routing SQL-looking input to the warm
/// analytics path.
pub fn looks_like_sql(text: &str) -> bool {
    let upper = text.trim_start().to_uppercase();
    ["SELECT ", "WITH ", "EXPLAIN "]
        .iter()
        .any(|kw| upper.starts_with(kw))
}

impl QueryEngine {
    pub fn new(
        config: Arc<Config>,
        strategy: Arc<RwLock<IndexStrategy>>,
        router: Arc<ShardRouter>,
        embed_cache: Arc<EmbeddingCache>,
        query_cache: Arc<QueryCache>,
        ranker: Ranker,
    ) -> Self {
        let federated = FederatedExecutor::new(
            router.clone(),
            Duration::from_millis(config.query.federated_timeout_ms),
        );
        Self {
            config,
            strategy,
            router,
            embed_cache,
            query_cache,
            federated,
            ranker,
            vector_ranker: Ranker::vector_only(),
        }
    }

    fn active_ranker(&self, opts: &QueryOptions) -> &Ranker {
        match opts.force_engine.as_deref() {
            Some("vector_search") => &self.vector_ranker,
            _ => &self.ranker,
        }
    }

    /// Run the full search pipeline for `text`.
    pub async fn execute_query(&self, text: &str, opts: &QueryOptions) -> Result<Vec<Candidate>> {
        if text.trim().is_empty() {
            return Err(LatticeError::InvalidInput("query must not be empty".into()));
        }

        let limit = opts.limit.unwrap_or(20).max(1);
        let ranker = self.active_ranker(opts);

        // Everything that affects the result set goes into the key; the
        // weight vector stands in for the ranker configuration.
        let key_text = format!(
            "{text}\u{1}{}\u{1}{}\u{1}{}\u{1}{}\u{1}{}",
            opts.level.map(|l| l.as_str()).unwrap_or(""),
            opts.where_clause.as_deref().unwrap_or(""),
            opts.expand_context,
            opts.force_engine.as_deref().unwrap_or(""),
            opts.min_similarity.unwrap_or(self.config.min_similarity),
        );
        let cache_key = QueryCache::key(
            &key_text,
            limit,
            ranker.fusion.as_str(),
            &ranker.weight_vector(),
        );
        if let Some(cached) = self.query_cache.get(&cache_key) {
            return Ok(cached);
        }

        let embedding = self
            .embed_cache
            .get_or_compute(&self.config.embedding, self.config.embedding_dim, text)
            .await?;

        let mut candidates = self.gather(&embedding, limit, opts).await?;

        if let Some(predicate) = &opts.where_clause {
            candidates = self.apply_predicate(candidates, predicate).await?;
        }

        candidates = self.attach_text(candidates, opts).await;

        let now_ts = chrono::Utc::now().timestamp();
        let ctx = ScoreContext::for_query(text, now_ts);
        let mut ranked = ranker.rank(candidates, &ctx);
        ranked.truncate(limit as usize);

        if opts.expand_context {
            self.attach_grounding(&mut ranked).await;
        }

        self.query_cache.insert(cache_key, ranked.clone());
        Ok(ranked)
    }

    /// Gather candidates from the active strategy.
    ///
    /// The centroid default probes each routed shard's ground-truth
    /// vectors concurrently; the in-memory strategies answer in one call.
    /// Both run under the per-shard deadline, and a failed or timed-out
    /// probe contributes nothing.
    async fn gather(
        &self,
        embedding: &[f32],
        limit: u32,
        opts: &QueryOptions,
    ) -> Result<Vec<Candidate>> {
        let per_shard_limit = (limit as usize * 2).max(32);
        let min_similarity = opts.min_similarity.unwrap_or(self.config.min_similarity);
        let deadline = Duration::from_millis(self.config.query.shard_timeout_ms);

        let shards = self.router.route_query(embedding, opts.shard_limit).await?;
        for shard in &shards {
            self.router.record_query(&shard.id).await;
        }

        let strategy = self.strategy.read().await;
        match &*strategy {
            IndexStrategy::Centroid(_) => {
                if shards.is_empty() {
                    return Ok(Vec::new());
                }
                let tasks = shards.iter().map(|shard| {
                    self.scan_shard(shard, embedding, per_shard_limit, min_similarity, opts.level, deadline)
                });
                let results = futures::future::join_all(tasks).await;

                let mut merged = Vec::new();
                let mut failures = 0;
                for (shard, result) in shards.iter().zip(results) {
                    match result {
                        Ok(cands) => merged.extend(cands),
                        Err(e) => {
                            failures += 1;
                            warn!(shard = %shard.id, error = %e, "shard gather degraded");
                        }
                    }
                }
                if failures == shards.len() {
                    return Err(LatticeError::ShardUnavailable(
                        "every routed shard failed".to_string(),
                    ));
                }

                // Union by id: the best similarity wins.
                let mut seen: HashMap<String, Candidate> = HashMap::new();
                for cand in merged {
                    match seen.get(&cand.id) {
                        Some(existing) if existing.similarity >= cand.similarity => {}
                        _ => {
                            seen.insert(cand.id.clone(), cand);
                        }
                    }
                }
                Ok(seen.into_values().collect())
            }
            other => {
                let find_opts = FindOptions {
                    limit: per_shard_limit as u32,
                    min_similarity,
                    shard_limit: opts.shard_limit,
                };
                match tokio::time::timeout(deadline, other.find_candidates(embedding, &find_opts))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LatticeError::Timeout(deadline)),
                }
            }
        }
    }

    async fn scan_shard(
        &self,
        shard: &ShardInfo,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        level: Option<ChunkLevel>,
        deadline: Duration,
    ) -> Result<Vec<Candidate>> {
        let work = async {
            let store = self.router.store_for(shard).await?;
            store.scan_vectors(embedding, limit, min_similarity, level).await
        };
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(LatticeError::Timeout(deadline)),
        }
    }

    /// Keep only candidates whose document satisfies the SQL predicate.
    async fn apply_predicate(
        &self,
        candidates: Vec<Candidate>,
        predicate: &str,
    ) -> Result<Vec<Candidate>> {
        let sql = format!("SELECT id FROM documents WHERE {predicate}");
        let rows = self.federated.execute(&sql, &[]).await?;
        let allowed: HashSet<String> = rows
            .iter()
            .filter_map(|r| r.get("id").and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|c| {
                let doc = c.doc_id.as_deref().unwrap_or(&c.id);
                allowed.contains(doc)
            })
            .collect())
    }

    /// Attach chunk text and doc ids to candidates that arrived bare
    /// (in-memory strategies return ids only). Candidates at the wrong
    /// level are dropped when a level filter is set.
    async fn attach_text(
        &self,
        candidates: Vec<Candidate>,
        opts: &QueryOptions,
    ) -> Vec<Candidate> {
        let shards = self.router.list_all_shards().await;
        let mut out = Vec::with_capacity(candidates.len());

        'next: for mut cand in candidates {
            if cand.text.is_some() {
                out.push(cand);
                continue;
            }
            for shard in &shards {
                let Ok(store) = self.router.store_for(shard).await else {
                    continue;
                };
                match store.get_chunk(&cand.id).await {
                    Ok(Some(chunk)) => {
                        if let Some(want) = opts.level {
                            if chunk.level != want {
                                continue 'next;
                            }
                        }
                        cand.doc_id = Some(chunk.doc_id.clone());
                        cand.text = Some(chunk.text.clone());
                        break;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(shard = %shard.id, error = %e, "text attach skipped shard");
                        continue;
                    }
                }
            }
            out.push(cand);
        }
        out
    }

    /// Resolve the parent chain of each result into a [`Reference`].
    async fn attach_grounding(&self, candidates: &mut [Candidate]) {
        let shards = self.router.list_all_shards().await;
        for cand in candidates.iter_mut() {
            for shard in &shards {
                let Ok(store) = self.router.store_for(shard).await else {
                    continue;
                };
                let Ok(Some(chunk)) = store.get_chunk(&cand.id).await else {
                    continue;
                };

                let parent_context = match &chunk.parent_id {
                    Some(parent_id) => match store.get_chunk(parent_id).await {
                        Ok(Some(parent)) => parent.text,
                        _ => String::new(),
                    },
                    None => String::new(),
                };

                cand.grounding = Some(Reference {
                    doc_id: chunk.doc_id.clone(),
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                    parent_context,
                });
                break;
            }
        }
    }

    pub fn embed_cache(&self) -> &EmbeddingCache {
        &self.embed_cache
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.query_cache
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn strategy(&self) -> &Arc<RwLock<IndexStrategy>> {
        &self.strategy
    }
}
