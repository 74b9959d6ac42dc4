//! Per-shard bloom filters over document ids.
//!
//! A negative answer is definite, so deletes and federated joins can skip
//! shards that certainly do not hold a document without touching SQLite.
//! Filters are rebuilt from the shard's `documents` table when a shard is
//! opened and updated on every insert; deletes leave the filter alone
//! (false positives are checked against storage anyway).

use bloomfilter::Bloom;
use std::collections::HashMap;
use std::sync::RwLock;

const EXPECTED_ITEMS: usize = 100_000;
const FALSE_POSITIVE_RATE: f64 = 0.01;

pub struct BloomFilterManager {
    filters: RwLock<HashMap<String, Bloom<String>>>,
}

impl Default for BloomFilterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomFilterManager {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// (Re)build the filter for a shard from its full id list.
    pub fn rebuild(&self, shard_id: &str, ids: &[String]) {
        let mut bloom = Bloom::new_for_fp_rate(EXPECTED_ITEMS.max(ids.len()), FALSE_POSITIVE_RATE);
        for id in ids {
            bloom.set(id);
        }
        self.filters
            .write()
            .unwrap()
            .insert(shard_id.to_string(), bloom);
    }

    pub fn insert(&self, shard_id: &str, doc_id: &str) {
        let mut filters = self.filters.write().unwrap();
        let bloom = filters
            .entry(shard_id.to_string())
            .or_insert_with(|| Bloom::new_for_fp_rate(EXPECTED_ITEMS, FALSE_POSITIVE_RATE));
        bloom.set(&doc_id.to_string());
    }

    /// `false` means the shard definitely does not contain the document.
    /// An unknown shard answers `true` (no filter, no claim).
    pub fn maybe_contains(&self, shard_id: &str, doc_id: &str) -> bool {
        match self.filters.read().unwrap().get(shard_id) {
            Some(bloom) => bloom.check(&doc_id.to_string()),
            None => true,
        }
    }

    pub fn drop_shard(&self, shard_id: &str) {
        self.filters.write().unwrap().remove(shard_id);
    }
}
