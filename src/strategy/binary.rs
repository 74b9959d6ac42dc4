//! Binary/Hamming strategy.
//!
//! Every document embedding is collapsed into a `B`-bit code by the
//! [`BinaryQuantizer`]; search encodes the query the same way and scans
//! all entries with the Hamming kernel. `similarity = 1 − hamming/B`.
//! Batch inserts fold the whole batch into the quantizer state before
//! encoding, so all codes in a batch share the same thresholds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{LatticeError, Result};
use crate::kernels::binary::{hamming, BinaryCode, BinaryMode, BinaryQuantizer};
use crate::models::{sort_by_similarity, Candidate};
use crate::strategy::{FindOptions, IndexEntry, StrategyStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BinaryEntry {
    code: BinaryCode,
    metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryIndex {
    dim: usize,
    quantizer: BinaryQuantizer,
    entries: HashMap<String, BinaryEntry>,
}

impl BinaryIndex {
    pub fn new(dim: usize, bits: usize, mode: &str, training_size: usize) -> Result<Self> {
        let mode = BinaryMode::parse(mode)?;
        Ok(Self {
            dim,
            quantizer: BinaryQuantizer::new(mode, bits.max(1), dim, training_size),
            entries: HashMap::new(),
        })
    }

    pub fn index_document(
        &mut self,
        id: &str,
        metadata: serde_json::Value,
        embedding: &[f32],
    ) -> Result<()> {
        LatticeError::check_dim(self.dim, embedding)?;
        self.quantizer.observe(embedding);
        let code = self.quantizer.encode(embedding);
        self.entries
            .insert(id.to_string(), BinaryEntry { code, metadata });
        Ok(())
    }

    /// Batch insert: one quantizer update for the whole batch, then encode.
    pub fn index_batch(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        for (_, _, embedding) in &entries {
            LatticeError::check_dim(self.dim, embedding)?;
        }
        for (_, _, embedding) in &entries {
            self.quantizer.observe(embedding);
        }
        for (id, metadata, embedding) in entries {
            let code = self.quantizer.encode(&embedding);
            self.entries.insert(id, BinaryEntry { code, metadata });
        }
        Ok(())
    }

    pub fn delete_document(&mut self, id: &str) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }

    pub fn find_candidates(&self, query: &[f32], opts: &FindOptions) -> Result<Vec<Candidate>> {
        LatticeError::check_dim(self.dim, query)?;
        let code = self.quantizer.encode(query);
        let bits = self.quantizer.bits() as f32;

        let mut candidates: Vec<Candidate> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                let d = hamming(&code, &entry.code);
                let similarity = 1.0 - d as f32 / bits;
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

    pub fn get_stats(&self) -> StrategyStats {
        StrategyStats {
            strategy: "binary".to_string(),
            doc_count: self.entries.len(),
            ..StrategyStats::default()
        }
    }
}
