//! Embedding and request caches.
//!
//! [`EmbeddingCache`] is a content-addressed LRU keyed by the exact input
//! text (no normalization: "Foo" and "foo" are distinct entries). The
//! request-level [`QueryCache`] stores fully ranked result lists under a
//! digest of the query parameters with a TTL; eviction is strict LRU on
//! capacity and lazy on TTL.

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::EmbeddingConfig;
use crate::embedding;
use crate::error::Result;
use crate::models::Candidate;

/// Cache hit/miss counters exposed via `/api/metrics`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
}

struct EmbeddingEntry {
    vector: Vec<f32>,
    stored_at: Instant,
}

struct EmbeddingCacheState {
    entries: LruCache<String, EmbeddingEntry>,
    metrics: CacheMetrics,
}

/// Content-addressed LRU over text → embedding.
pub struct EmbeddingCache {
    state: Mutex<EmbeddingCacheState>,
    capacity: usize,
    /// `None` disables expiry; otherwise entries expire lazily on read.
    ttl: Option<Duration>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_ttl(capacity, None)
    }

    pub fn with_ttl(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(EmbeddingCacheState {
                entries: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
                metrics: CacheMetrics::default(),
            }),
            capacity,
            ttl,
        }
    }

    /// Look up an embedding, counting the hit or miss. Entries past the
    /// TTL count as misses and are dropped.
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let mut state = self.state.lock().unwrap();
        let hit = match state.entries.get(text) {
            Some(entry) => {
                let expired = self
                    .ttl
                    .map(|ttl| entry.stored_at.elapsed() > ttl)
                    .unwrap_or(false);
                if expired {
                    None
                } else {
                    Some(entry.vector.clone())
                }
            }
            None => None,
        };
        match hit {
            Some(v) => {
                state.metrics.hits += 1;
                Some(v)
            }
            None => {
                state.entries.pop(text);
                state.metrics.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, text: String, vector: Vec<f32>) {
        let mut state = self.state.lock().unwrap();
        state.entries.put(
            text,
            EmbeddingEntry {
                vector,
                stored_at: Instant::now(),
            },
        );
    }

    /// Cached embedding for `text`, computing through the provider on miss.
    pub async fn get_or_compute(
        &self,
        config: &EmbeddingConfig,
        dim: usize,
        text: &str,
    ) -> Result<Vec<f32>> {
        if let Some(v) = self.get(text) {
            return Ok(v);
        }
        let v = embedding::encode_one(config, dim, text).await?;
        self.insert(text.to_string(), v.clone());
        Ok(v)
    }

    /// Batch lookup: cached texts come from the cache, the rest go to the
    /// provider in one call, in input order.
    pub async fn get_or_compute_batch(
        &self,
        config: &EmbeddingConfig,
        dim: usize,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.get(t)).collect();

        let missing: Vec<(usize, String)> = out
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| (i, texts[i].clone()))
            .collect();

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let computed = embedding::encode_batch(config, dim, &batch).await?;
            for ((i, text), vector) in missing.into_iter().zip(computed.into_iter()) {
                self.insert(text, vector.clone());
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().map(|v| v.unwrap()).collect())
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.state.lock().unwrap().metrics
    }

    /// Clear all entries and reset the counters.
    pub fn reset_state(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries = LruCache::new(NonZeroUsize::new(self.capacity).unwrap());
        state.metrics = CacheMetrics::default();
    }
}

struct QueryCacheEntry {
    results: Vec<Candidate>,
    stored_at: Instant,
}

/// TTL-bounded LRU over ranked query results.
pub struct QueryCache {
    state: Mutex<LruCache<String, QueryCacheEntry>>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            ttl,
        }
    }

    /// Digest of everything that affects a query's result set.
    pub fn key(text: &str, limit: u32, fusion: &str, weights: &[(String, f32)]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(limit.to_le_bytes());
        hasher.update(fusion.as_bytes());
        for (name, weight) in weights {
            hasher.update(name.as_bytes());
            hasher.update(weight.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Vec<Candidate>> {
        let mut state = self.state.lock().unwrap();
        let expired = match state.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => {
                return Some(entry.results.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.pop(key);
        }
        None
    }

    pub fn insert(&self, key: String, results: Vec<Candidate>) {
        let mut state = self.state.lock().unwrap();
        state.put(
            key,
            QueryCacheEntry {
                results,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = EmbeddingCache::new(4);
        assert!(cache.get("a").is_none());
        cache.insert("a".to_string(), vec![1.0]);
        assert_eq!(cache.get("a").unwrap(), vec![1.0]);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[test]
    fn test_exact_text_keying() {
        let cache = EmbeddingCache::new(4);
        cache.insert("Foo".to_string(), vec![1.0]);
        assert!(cache.get("foo").is_none());
    }

    #[test]
    fn test_lru_eviction_on_capacity() {
        let cache = EmbeddingCache::new(2);
        cache.insert("a".to_string(), vec![1.0]);
        cache.insert("b".to_string(), vec![2.0]);
        cache.get("a");
        cache.insert("c".to_string(), vec![3.0]);
        // "b" was least recently used
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_reset_state() {
        let cache = EmbeddingCache::new(4);
        cache.insert("a".to_string(), vec![1.0]);
        cache.get("a");
        cache.reset_state();
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.misses, 0);
        assert!(cache.get("a").is_none());
    }

    #[tokio::test]
    async fn test_get_or_compute_batch_mixes_sources() {
        let cache = EmbeddingCache::new(8);
        let config = EmbeddingConfig::default();
        let seeded = crate::embedding::hashed_embedding("known", 8);
        cache.insert("known".to_string(), seeded.clone());

        let texts = vec!["known".to_string(), "fresh".to_string()];
        let out = cache.get_or_compute_batch(&config, 8, &texts).await.unwrap();
        assert_eq!(out[0], seeded);
        assert_eq!(out[1], crate::embedding::hashed_embedding("fresh", 8));
        // second call is all hits
        let before = cache.metrics().hits;
        cache.get_or_compute_batch(&config, 8, &texts).await.unwrap();
        assert_eq!(cache.metrics().hits, before + 2);
    }

    #[test]
    fn test_embedding_ttl_lazy_expiry() {
        let cache = EmbeddingCache::with_ttl(4, Some(Duration::from_millis(0)));
        cache.insert("a".to_string(), vec![1.0]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a").is_none());
        // the expired entry was dropped, not just hidden
        assert_eq!(cache.metrics().misses, 1);
    }

    #[test]
    fn test_query_cache_ttl_lazy_expiry() {
        let cache = QueryCache::new(4, Duration::from_millis(0));
        cache.insert("k".to_string(), vec![Candidate::new("d", 1.0)]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_query_cache_key_sensitivity() {
        let w = vec![("vector".to_string(), 1.0f32)];
        let a = QueryCache::key("q", 10, "rrf", &w);
        let b = QueryCache::key("q", 20, "rrf", &w);
        let c = QueryCache::key("q", 10, "max", &w);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
