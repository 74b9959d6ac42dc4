//! Centroid routing strategy (the default).
//!
//! Vectors live in logical shards, each summarized by the incremental mean
//! of its members. A new vector goes to the closest shard by cosine unless
//! that shard is full or too far away (cosine below the split threshold),
//! in which case a fresh shard seeds at the vector. Queries rank shards by
//! cosine to the query, probe the top `K` (default `log2(#shards) + 1`),
//! and re-rank the union by exact cosine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{LatticeError, Result};
use crate::kernels::distance::{cosine, norm, unit_similarity};
use crate::models::{sort_by_similarity, Candidate};
use crate::strategy::{FindOptions, StrategyStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemShard {
    centroid: Vec<f32>,
    centroid_norm: f32,
    members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    vector: Vec<f32>,
    metadata: serde_json::Value,
    shard: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidIndex {
    dim: usize,
    max_shard_size: usize,
    split_threshold: f32,
    next_shard: u32,
    shards: HashMap<u32, MemShard>,
    entries: HashMap<String, Entry>,
}

impl CentroidIndex {
    pub fn new(dim: usize, max_shard_size: usize, split_threshold: f32) -> Self {
        Self {
            dim,
            max_shard_size: max_shard_size.max(1),
            split_threshold,
            next_shard: 0,
            shards: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn index_document(
        &mut self,
        id: &str,
        metadata: serde_json::Value,
        embedding: &[f32],
    ) -> Result<()> {
        LatticeError::check_dim(self.dim, embedding)?;

        if self.entries.contains_key(id) {
            self.delete_document(id)?;
        }

        let shard_id = match self.place(embedding) {
            Some(shard_id) => {
                let shard = self.shards.get_mut(&shard_id).unwrap();
                shard.members.push(id.to_string());
                let n = shard.members.len() as f32;
                for (c, x) in shard.centroid.iter_mut().zip(embedding.iter()) {
                    *c += (x - *c) / n;
                }
                shard.centroid_norm = norm(&shard.centroid);
                shard_id
            }
            None => {
                let shard_id = self.next_shard;
                self.next_shard += 1;
                self.shards.insert(
                    shard_id,
                    MemShard {
                        centroid: embedding.to_vec(),
                        centroid_norm: norm(embedding),
                        members: vec![id.to_string()],
                    },
                );
                shard_id
            }
        };

        self.entries.insert(
            id.to_string(),
            Entry {
                vector: embedding.to_vec(),
                metadata,
                shard: shard_id,
            },
        );
        Ok(())
    }

    /// Closest open shard, or `None` when a new shard must be seeded.
    fn place(&self, embedding: &[f32]) -> Option<u32> {
        let mut best: Option<(u32, f32)> = None;
        for (&shard_id, shard) in &self.shards {
            if shard.members.len() >= self.max_shard_size {
                continue;
            }
            let sim = cosine(embedding, &shard.centroid);
            match best {
                Some((_, b)) if sim <= b => {}
                _ => best = Some((shard_id, sim)),
            }
        }
        match best {
            Some((shard_id, sim)) if sim >= self.split_threshold => Some(shard_id),
            _ => None,
        }
    }

    pub fn delete_document(&mut self, id: &str) -> Result<()> {
        let Some(entry) = self.entries.remove(id) else {
            return Ok(());
        };

        if let Some(shard) = self.shards.get_mut(&entry.shard) {
            shard.members.retain(|m| m != id);
            let n = shard.members.len();
            if n == 0 {
                self.shards.remove(&entry.shard);
            } else {
                // Reverse the incremental mean: mean' = (mean·(n+1) − v) / n
                for (c, x) in shard.centroid.iter_mut().zip(entry.vector.iter()) {
                    *c = (*c * (n as f32 + 1.0) - x) / n as f32;
                }
                shard.centroid_norm = norm(&shard.centroid);
            }
        }
        Ok(())
    }

    pub fn find_candidates(&self, query: &[f32], opts: &FindOptions) -> Result<Vec<Candidate>> {
        LatticeError::check_dim(self.dim, query)?;
        if self.shards.is_empty() {
            return Ok(Vec::new());
        }

        let default_probes = ((self.shards.len() as f32).log2().floor() as usize) + 1;
        let probes = opts
            .shard_limit
            .map(|k| k as usize)
            .unwrap_or(default_probes)
            .max(1);

        let mut ranked: Vec<(&u32, f32)> = self
            .shards
            .iter()
            .map(|(id, s)| (id, cosine(query, &s.centroid)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(probes);

        let mut candidates = Vec::new();
        for (shard_id, _) in ranked {
            let shard = &self.shards[shard_id];
            for member in &shard.members {
                let entry = &self.entries[member];
                let similarity = unit_similarity(query, &entry.vector);
                if similarity < opts.min_similarity {
                    continue;
                }
                candidates.push(
                    Candidate::new(member.clone(), similarity)
                        .with_metadata(entry.metadata.clone()),
                );
            }
        }

        sort_by_similarity(&mut candidates);
        candidates.truncate(opts.limit as usize);
        Ok(candidates)
    }

    pub fn get_stats(&self) -> StrategyStats {
        StrategyStats {
            strategy: "centroid".to_string(),
            doc_count: self.entries.len(),
            shard_count: Some(self.shards.len()),
            ..StrategyStats::default()
        }
    }

    #[cfg(test)]
    fn shard_doc_counts(&self) -> usize {
        self.shards.values().map(|s| s.members.len()).sum()
    }
}
