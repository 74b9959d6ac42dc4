//! Inverted-file (IVF) strategy.
//!
//! Vectors buffer verbatim until `training_size` is reached; queries in
//! the buffering phase fall back to an exact scan rather than failing
//! (`not_trained` never escapes the strategy). Training runs k-means over
//! the buffer and files every vector into the inverted list of its
//! nearest centroid; queries then rank centroids and probe only the top
//! `n_probe` lists, re-ranking the union by exact cosine. A reverse map
//! `id → list` keeps deletes off the scan path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{LatticeError, Result};
use crate::kernels::distance::{l2_sq, unit_similarity};
use crate::kernels::kmeans::{kmeans, nearest_centroid};
use crate::models::{sort_by_similarity, Candidate};
use crate::strategy::{FindOptions, StrategyStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    vector: Vec<f32>,
    metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dim: usize,
    n_lists: usize,
    n_probe: usize,
    training_size: usize,
    entries: HashMap<String, Entry>,
    centroids: Option<Vec<Vec<f32>>>,
    lists: Vec<Vec<String>>,
    assignments: HashMap<String, usize>,
}

impl IvfIndex {
    pub fn new(dim: usize, n_lists: usize, n_probe: usize, training_size: usize) -> Self {
        Self {
            dim,
            n_lists: n_lists.max(1),
            n_probe: n_probe.max(1),
            training_size: training_size.max(1),
            entries: HashMap::new(),
            centroids: None,
            lists: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    fn trained(&self) -> bool {
        self.centroids.is_some()
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

        self.entries.insert(
            id.to_string(),
            Entry {
                vector: embedding.to_vec(),
                metadata,
            },
        );

        if let Some(centroids) = &self.centroids {
            let list = nearest_centroid(embedding, centroids);
            self.lists[list].push(id.to_string());
            self.assignments.insert(id.to_string(), list);
        } else if self.entries.len() >= self.training_size {
            self.train();
        }
        Ok(())
    }

    /// Cluster the buffered vectors and file each into its list.
    fn train(&mut self) {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        let vectors: Vec<Vec<f32>> = ids.iter().map(|id| self.entries[id].vector.clone()).collect();

        let mut rng = rand::thread_rng();
        let clustering = kmeans(&vectors, self.n_lists, &mut rng);

        let mut lists = vec![Vec::new(); clustering.centroids.len()];
        let mut assignments = HashMap::new();
        for (id, &list) in ids.iter().zip(clustering.assignments.iter()) {
            lists[list].push(id.clone());
            assignments.insert(id.clone(), list);
        }

        self.centroids = Some(clustering.centroids);
        self.lists = lists;
        self.assignments = assignments;
    }

    pub fn delete_document(&mut self, id: &str) -> Result<()> {
        if self.entries.remove(id).is_none() {
            return Ok(());
        }
        if let Some(list) = self.assignments.remove(id) {
            self.lists[list].retain(|m| m != id);
        }
        Ok(())
    }

    pub fn find_candidates(&self, query: &[f32], opts: &FindOptions) -> Result<Vec<Candidate>> {
        LatticeError::check_dim(self.dim, query)?;

        let scan_ids: Vec<&String> = match &self.centroids {
            // Buffering phase: exact scan over everything.
            None => self.entries.keys().collect(),
            Some(centroids) => {
                let mut ranked: Vec<(usize, f32)> = centroids
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (i, l2_sq(query, c)))
                    .collect();
                ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                ranked
                    .iter()
                    .take(self.n_probe)
                    .flat_map(|(i, _)| self.lists[*i].iter())
                    .collect()
            }
        };

        let mut candidates: Vec<Candidate> = scan_ids
            .into_iter()
            .filter_map(|id| {
                let entry = &self.entries[id];
                let similarity = unit_similarity(query, &entry.vector);
                if similarity < opts.min_similarity {
                    return None;
                }
                Some(Candidate::new(id.clone(), similarity).with_metadata(entry.metadata.clone()))
            })
            .collect();

        sort_by_similarity(&mut candidates);
        candidates.truncate(opts.limit as usize);
        Ok(candidates)
    }

    /// Retrain the lists from the live entries. Useful after heavy churn.
    pub fn optimize(&mut self) -> Result<()> {
        if self.trained() && !self.entries.is_empty() {
            self.train();
        }
        Ok(())
    }

    pub fn get_stats(&self) -> StrategyStats {
        StrategyStats {
            strategy: "ivf".to_string(),
            doc_count: self.entries.len(),
            trained: Some(self.trained()),
            shard_count: Some(self.lists.len()),
            ..StrategyStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(dim: usize, n: usize) -> Vec<(String, Vec<f32>)> {
        (0..n)
            .map(|i| {
                (
                    format!("doc{i:03}"),
                    crate::embedding::hashed_embedding(&format!("doc{i:03}"), dim),
                )
            })
            .collect()
    }

    #[test]
    fn test_exact_scan_before_training() {
        let mut idx = IvfIndex::new(4, 4, 2, 100);
        idx.index_document("a", serde_json::Value::Null, &[1.0, 0.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(idx.get_stats().trained, Some(false));

        let found = idx
            .find_candidates(&[1.0, 0.0, 0.0, 0.0], &FindOptions::with_limit(1))
            .unwrap();
        assert_eq!(found[0].id, "a");
    }

    #[test]
    fn test_trains_at_threshold() {
        let mut idx = IvfIndex::new(8, 4, 4, 16);
        for (id, v) in seeded(8, 16) {
            idx.index_document(&id, serde_json::Value::Null, &v).unwrap();
        }
        assert_eq!(idx.get_stats().trained, Some(true));

        // Insert-then-find still holds after training (probing all lists).
        let probe = crate::embedding::hashed_embedding("doc003", 8);
        let found = idx.find_candidates(&probe, &FindOptions::with_limit(1)).unwrap();
        assert_eq!(found[0].id, "doc003");
    }

    #[test]
    fn test_post_training_inserts_go_to_lists() {
        let mut idx = IvfIndex::new(4, 2, 2, 4);
        for (id, v) in seeded(4, 4) {
            idx.index_document(&id, serde_json::Value::Null, &v).unwrap();
        }
        idx.index_document("late", serde_json::Value::Null, &[0.5, 0.5, 0.5, 0.5])
            .unwrap();
        assert!(idx.assignments.contains_key("late"));

        let found = idx
            .find_candidates(&[0.5, 0.5, 0.5, 0.5], &FindOptions::with_limit(1))
            .unwrap();
        assert_eq!(found[0].id, "late");
    }

    #[test]
    fn test_delete_via_reverse_map() {
        let mut idx = IvfIndex::new(4, 2, 2, 4);
        for (id, v) in seeded(4, 6) {
            idx.index_document(&id, serde_json::Value::Null, &v).unwrap();
        }
        idx.delete_document("doc002").unwrap();
        assert!(!idx.assignments.contains_key("doc002"));
        assert!(idx.lists.iter().all(|l| !l.contains(&"doc002".to_string())));

        let probe = crate::embedding::hashed_embedding("doc002", 4);
        let found = idx.find_candidates(&probe, &FindOptions::with_limit(6)).unwrap();
        assert!(found.iter().all(|c| c.id != "doc002"));
    }

    #[test]
    fn test_optimize_retrains() {
        let mut idx = IvfIndex::new(4, 2, 2, 4);
        for (id, v) in seeded(4, 8) {
            idx.index_document(&id, serde_json::Value::Null, &v).unwrap();
        }
        for i in 0..4 {
            idx.delete_document(&format!("doc{i:03}")).unwrap();
        }
        idx.optimize().unwrap();
        let total: usize = idx.lists.iter().map(|l| l.len()).sum();
        assert_eq!(total, 4);
    }
}
