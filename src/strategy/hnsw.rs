//! Hierarchical navigable small-world graph.
//!
//! Standard HNSW with cosine distance: nodes get a geometrically sampled
//! level (`⌊-ln(U)·mL⌋`, `mL = 1/ln(M)`), inserts greedy-descend from the
//! entry point and run a beam search per layer, and neighbors are chosen
//! by the diversity heuristic (a candidate is kept only while it is closer
//! to the query than to every already-kept neighbor). Edges are
//! undirected; after connecting, each touched neighbor is shrunk back to
//! its layer cap (`M`, or `2M` on layer 0).
//!
//! Deletes tombstone the node: it disappears from every neighbor set on
//! every layer, and the entry point reseeds to a remaining node at the
//! highest occupied level.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::error::{LatticeError, Result};
use crate::models::{sort_by_similarity, Candidate};
use crate::strategy::{FindOptions, StrategyStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HnswNode {
    vector: Vec<f32>,
    level: usize,
    metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndex {
    dim: usize,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    ml: f64,
    nodes: HashMap<String, HnswNode>,
    /// `layers[l][id]` = neighbor ids of `id` on layer `l`.
    layers: Vec<HashMap<String, BTreeSet<String>>>,
    entry: Option<String>,
}

/// Search-frontier element ordered by distance, then id for determinism.
#[derive(Debug, Clone, PartialEq)]
struct Near {
    dist: f32,
    id: String,
}

impl Eq for Near {}

impl PartialOrd for Near {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Near {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Cosine distance: `1 − cos`, in `[0, 2]`.
fn distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - crate::kernels::distance::cosine(a, b)
}

impl HnswIndex {
    pub fn new(dim: usize, m: usize, ef_construction: usize, ef_search: usize) -> Self {
        let m = m.max(2);
        Self {
            dim,
            m,
            m_max0: 2 * m,
            ef_construction: ef_construction.max(m),
            ef_search: ef_search.max(1),
            ml: 1.0 / (m as f64).ln(),
            nodes: HashMap::new(),
            layers: Vec::new(),
            entry: None,
        }
    }

    fn sample_level(&self) -> usize {
        let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        (-u.ln() * self.ml).floor() as usize
    }

    fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0
        } else {
            self.m
        }
    }

    pub fn index_document(
        &mut self,
        id: &str,
        metadata: serde_json::Value,
        embedding: &[f32],
    ) -> Result<()> {
        LatticeError::check_dim(self.dim, embedding)?;

        if self.nodes.contains_key(id) {
            self.delete_document(id)?;
        }

        let level = self.sample_level();
        while self.layers.len() <= level {
            self.layers.push(HashMap::new());
        }

        self.nodes.insert(
            id.to_string(),
            HnswNode {
                vector: embedding.to_vec(),
                level,
                metadata,
            },
        );
        for l in 0..=level {
            self.layers[l].insert(id.to_string(), BTreeSet::new());
        }

        let Some(entry_id) = self.entry.clone() else {
            self.entry = Some(id.to_string());
            return Ok(());
        };

        let entry_level = self.nodes[&entry_id].level;
        let mut ep = entry_id.clone();

        // Greedy descent through layers above the new node's level.
        if level < entry_level {
            for l in ((level + 1)..=entry_level).rev() {
                if let Some(best) = self.search_layer(embedding, &ep, 1, l).into_iter().next() {
                    ep = best.id;
                }
            }
        }

        // Connect on every layer the node participates in.
        for l in (0..=level.min(entry_level)).rev() {
            let found = self.search_layer(embedding, &ep, self.ef_construction, l);
            let neighbors = self.select_neighbors(&found, self.m);

            for n in &neighbors {
                self.layers[l].get_mut(id).unwrap().insert(n.clone());
                self.layers[l].get_mut(n).unwrap().insert(id.to_string());
            }
            for n in &neighbors {
                self.shrink_connections(n, l);
            }

            if let Some(best) = found.first() {
                ep = best.id.clone();
            }
        }

        if level > entry_level {
            self.entry = Some(id.to_string());
        }
        Ok(())
    }

    /// Beam search on one layer, returning up to `ef` nearest nodes in
    /// ascending distance order.
    fn search_layer(&self, query: &[f32], entry: &str, ef: usize, layer: usize) -> Vec<Near> {
        let Some(entry_node) = self.nodes.get(entry) else {
            return Vec::new();
        };

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(entry.to_string());

        let start = Near {
            dist: distance(query, &entry_node.vector),
            id: entry.to_string(),
        };

        // Candidates: min-heap (explore closest first). Results: max-heap
        // of size ef (peek = current worst).
        let mut candidates: BinaryHeap<std::cmp::Reverse<Near>> = BinaryHeap::new();
        let mut results: BinaryHeap<Near> = BinaryHeap::new();
        candidates.push(std::cmp::Reverse(start.clone()));
        results.push(start);

        while let Some(std::cmp::Reverse(current)) = candidates.pop() {
            let worst = results.peek().map(|n| n.dist).unwrap_or(f32::INFINITY);
            if current.dist > worst && results.len() >= ef {
                break;
            }

            let Some(neighbors) = self.layers[layer].get(&current.id) else {
                continue;
            };
            for neighbor in neighbors {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let d = distance(query, &self.nodes[neighbor].vector);
                let worst = results.peek().map(|n| n.dist).unwrap_or(f32::INFINITY);
                if results.len() < ef || d < worst {
                    let near = Near {
                        dist: d,
                        id: neighbor.clone(),
                    };
                    candidates.push(std::cmp::Reverse(near.clone()));
                    results.push(near);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort();
        out
    }

    /// Diversity heuristic over candidates carrying their distance to the
    /// search target: keep one only if it is closer to the target than to
    /// every already-kept neighbor; backfill with the closest rejects when
    /// fewer than `count` survive.
    fn select_neighbors(&self, candidates: &[Near], count: usize) -> Vec<String> {
        let mut selected: Vec<Near> = Vec::new();
        let mut rejected: Vec<Near> = Vec::new();

        for cand in candidates {
            if selected.len() >= count {
                break;
            }
            let diverse = selected.iter().all(|s| {
                distance(&self.nodes[&cand.id].vector, &self.nodes[&s.id].vector) >= cand.dist
            });
            if diverse {
                selected.push(cand.clone());
            } else {
                rejected.push(cand.clone());
            }
        }

        for r in rejected {
            if selected.len() >= count {
                break;
            }
            selected.push(r);
        }

        selected.into_iter().map(|n| n.id).collect()
    }

    /// Re-select a node's neighbor set down to the layer cap, dropping
    /// the pruned edges symmetrically.
    fn shrink_connections(&mut self, id: &str, layer: usize) {
        let cap = self.max_degree(layer);
        let current: Vec<String> = match self.layers[layer].get(id) {
            Some(set) if set.len() > cap => set.iter().cloned().collect(),
            _ => return,
        };

        let vector = self.nodes[id].vector.clone();
        let mut ranked: Vec<Near> = current
            .iter()
            .map(|n| Near {
                dist: distance(&vector, &self.nodes[n].vector),
                id: n.clone(),
            })
            .collect();
        ranked.sort();

        let keep: BTreeSet<String> = self.select_neighbors(&ranked, cap).into_iter().collect();

        for n in &current {
            if !keep.contains(n) {
                if let Some(set) = self.layers[layer].get_mut(n) {
                    set.remove(id);
                }
            }
        }
        self.layers[layer].insert(id.to_string(), keep);
    }

    pub fn delete_document(&mut self, id: &str) -> Result<()> {
        let Some(node) = self.nodes.remove(id) else {
            return Ok(());
        };

        for l in 0..=node.level {
            if let Some(neighbors) = self.layers[l].remove(id) {
                for n in neighbors {
                    if let Some(set) = self.layers[l].get_mut(&n) {
                        set.remove(id);
                    }
                }
            }
        }

        while let Some(top) = self.layers.last() {
            if top.is_empty() && self.layers.len() > 1 {
                self.layers.pop();
            } else {
                break;
            }
        }

        if self.entry.as_deref() == Some(id) {
            self.entry = self
                .nodes
                .iter()
                .max_by(|a, b| a.1.level.cmp(&b.1.level).then_with(|| b.0.cmp(a.0)))
                .map(|(id, _)| id.clone());
        }
        Ok(())
    }

    pub fn find_candidates(&self, query: &[f32], opts: &FindOptions) -> Result<Vec<Candidate>> {
        LatticeError::check_dim(self.dim, query)?;
        let Some(entry_id) = &self.entry else {
            return Ok(Vec::new());
        };

        let entry_level = self.nodes[entry_id].level;
        let mut ep = entry_id.clone();
        for l in (1..=entry_level).rev() {
            if let Some(best) = self.search_layer(query, &ep, 1, l).into_iter().next() {
                ep = best.id;
            }
        }

        let ef = self.ef_search.max(opts.limit as usize);
        let found = self.search_layer(query, &ep, ef, 0);

        let mut candidates: Vec<Candidate> = found
            .into_iter()
            .filter_map(|near| {
                let similarity = (1.0 - near.dist).clamp(0.0, 1.0);
                if similarity < opts.min_similarity {
                    return None;
                }
                let node = &self.nodes[&near.id];
                Some(Candidate::new(near.id, similarity).with_metadata(node.metadata.clone()))
            })
            .collect();

        sort_by_similarity(&mut candidates);
        candidates.truncate(opts.limit as usize);
        Ok(candidates)
    }

    pub fn get_stats(&self) -> StrategyStats {
        StrategyStats {
            strategy: "hnsw".to_string(),
            doc_count: self.nodes.len(),
            layer_count: Some(self.layers.len()),
            ..StrategyStats::default()
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (l, layer) in self.layers.iter().enumerate() {
            let cap = self.max_degree(l);
            for (id, neighbors) in layer {
                assert!(
                    neighbors.len() <= cap,
                    "node {id} has {} neighbors on layer {l}, cap {cap}",
                    neighbors.len()
                );
                for n in neighbors {
                    assert!(
                        layer.get(n).map(|s| s.contains(id)).unwrap_or(false),
                        "edge {id}↔{n} asymmetric on layer {l}"
                    );
                }
            }
        }
        if self.nodes.is_empty() {
            assert!(self.entry.is_none());
        } else {
            assert!(self.nodes.contains_key(self.entry.as_ref().unwrap()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_vectors() -> Vec<(String, Vec<f32>)> {
        vec![
            ("noise-a".to_string(), vec![1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, -1.0]),
            ("noise-b".to_string(), vec![-1.0, 0.0, 1.0, -1.0, 0.0, 1.0, -1.0, 0.0]),
            ("noise-c".to_string(), vec![0.0, 1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0]),
            ("noise-d".to_string(), vec![-1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0]),
        ]
    }

    #[test]
    fn test_target_beats_noise() {
        let mut idx = HnswIndex::new(8, 4, 50, 20);
        idx.index_document("target", serde_json::Value::Null, &[0.5; 8])
            .unwrap();
        for (id, v) in noise_vectors() {
            idx.index_document(&id, serde_json::Value::Null, &v).unwrap();
        }

        let found = idx
            .find_candidates(&[0.51; 8], &FindOptions::with_limit(3))
            .unwrap();
        assert_eq!(found[0].id, "target");
        assert!(found[0].similarity > 0.99);
    }

    #[test]
    fn test_invariants_after_many_inserts() {
        let mut idx = HnswIndex::new(8, 4, 32, 16);
        for i in 0..60 {
            let v = crate::embedding::hashed_embedding(&format!("node{i}"), 8);
            idx.index_document(&format!("node{i}"), serde_json::Value::Null, &v)
                .unwrap();
        }
        idx.check_invariants();
        assert_eq!(idx.get_stats().doc_count, 60);
    }

    #[test]
    fn test_delete_removes_edges_and_reseeds_entry() {
        let mut idx = HnswIndex::new(4, 4, 16, 8);
        for i in 0..10 {
            let v = crate::embedding::hashed_embedding(&format!("n{i}"), 4);
            idx.index_document(&format!("n{i}"), serde_json::Value::Null, &v)
                .unwrap();
        }

        let entry = idx.entry.clone().unwrap();
        idx.delete_document(&entry).unwrap();
        idx.check_invariants();
        assert_eq!(idx.nodes.len(), 9);
        assert!(idx.entry.is_some());
        assert_ne!(idx.entry.as_ref().unwrap(), &entry);

        // Remaining nodes are still findable.
        let probe = crate::embedding::hashed_embedding("n1", 4);
        let found = idx.find_candidates(&probe, &FindOptions::with_limit(1)).unwrap();
        assert!(!found.is_empty());
    }

    #[test]
    fn test_delete_all_clears_entry() {
        let mut idx = HnswIndex::new(4, 4, 16, 8);
        idx.index_document("only", serde_json::Value::Null, &[1.0, 0.0, 0.0, 0.0])
            .unwrap();
        idx.delete_document("only").unwrap();
        assert!(idx.entry.is_none());
        assert!(idx
            .find_candidates(&[1.0, 0.0, 0.0, 0.0], &FindOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_update_in_place() {
        let mut idx = HnswIndex::new(4, 4, 16, 8);
        idx.index_document("a", serde_json::Value::Null, &[1.0, 0.0, 0.0, 0.0])
            .unwrap();
        idx.index_document("a", serde_json::Value::Null, &[0.0, 1.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(idx.get_stats().doc_count, 1);
        let found = idx
            .find_candidates(&[0.0, 1.0, 0.0, 0.0], &FindOptions::with_limit(1))
            .unwrap();
        assert!(found[0].similarity > 0.99);
    }

    #[test]
    fn test_monotone_similarity_order() {
        let mut idx = HnswIndex::new(4, 4, 32, 16);
        idx.index_document("close", serde_json::Value::Null, &[1.0, 0.1, 0.0, 0.0])
            .unwrap();
        idx.index_document("mid", serde_json::Value::Null, &[0.7, 0.7, 0.0, 0.0])
            .unwrap();
        idx.index_document("far", serde_json::Value::Null, &[0.0, 1.0, 0.0, 0.0])
            .unwrap();

        let found = idx
            .find_candidates(&[1.0, 0.0, 0.0, 0.0], &FindOptions::with_limit(3))
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["close", "mid", "far"]);
        assert!(found[0].similarity >= found[1].similarity);
        assert!(found[1].similarity >= found[2].similarity);
    }
}
