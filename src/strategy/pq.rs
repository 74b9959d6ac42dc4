//! Product-quantization strategy.
//!
//! Buffers raw vectors until `training_size`, answering queries with an
//! exact scan. Training fits the codebooks and collapses every buffered
//! vector into an `M`-byte code; raw vectors are dropped. Queries against
//! the trained index build one ADC table and score each code with `M`
//! lookups, mapping distance to similarity via `1/(1+d)`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{LatticeError, Result};
use crate::kernels::distance::{similarity_from_distance, unit_similarity};
use crate::kernels::pq::CodebookSet;
use crate::models::{sort_by_similarity, Candidate};
use crate::strategy::{FindOptions, StrategyStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqIndex {
    dim: usize,
    m: usize,
    k_sub: usize,
    training_size: usize,
    /// Raw vectors, only populated while untrained.
    buffer: HashMap<String, Vec<f32>>,
    metadata: HashMap<String, serde_json::Value>,
    codebooks: Option<CodebookSet>,
    codes: HashMap<String, Vec<u8>>,
}

impl PqIndex {
    pub fn new(dim: usize, m: usize, k_sub: usize, training_size: usize) -> Result<Self> {
        if m == 0 || dim % m != 0 {
            return Err(LatticeError::InvalidInput(format!(
                "dimension {dim} is not divisible into {m} sub-vectors"
            )));
        }
        if k_sub == 0 || k_sub > 256 {
            return Err(LatticeError::InvalidInput(format!(
                "pq centroid count must be in 1..=256, got {k_sub}"
            )));
        }
        Ok(Self {
            dim,
            m,
            k_sub,
            training_size: training_size.max(1),
            buffer: HashMap::new(),
            metadata: HashMap::new(),
            codebooks: None,
            codes: HashMap::new(),
        })
    }

    fn trained(&self) -> bool {
        self.codebooks.is_some()
    }

    pub fn index_document(
        &mut self,
        id: &str,
        metadata: serde_json::Value,
        embedding: &[f32],
    ) -> Result<()> {
        LatticeError::check_dim(self.dim, embedding)?;
        self.metadata.insert(id.to_string(), metadata);

        match &self.codebooks {
            Some(books) => {
                let code = books.encode(embedding)?;
                self.codes.insert(id.to_string(), code);
            }
            None => {
                self.buffer.insert(id.to_string(), embedding.to_vec());
                if self.buffer.len() >= self.training_size {
                    self.train()?;
                }
            }
        }
        Ok(())
    }

    fn train(&mut self) -> Result<()> {
        let vectors: Vec<Vec<f32>> = self.buffer.values().cloned().collect();
        let mut rng = rand::thread_rng();
        let books = CodebookSet::train(&vectors, self.m, self.k_sub, &mut rng)?;

        let mut codes = HashMap::with_capacity(self.buffer.len());
        for (id, vector) in self.buffer.drain() {
            codes.insert(id, books.encode(&vector)?);
        }
        self.codebooks = Some(books);
        self.codes = codes;
        Ok(())
    }

    pub fn delete_document(&mut self, id: &str) -> Result<()> {
        self.buffer.remove(id);
        self.codes.remove(id);
        self.metadata.remove(id);
        Ok(())
    }

    pub fn find_candidates(&self, query: &[f32], opts: &FindOptions) -> Result<Vec<Candidate>> {
        LatticeError::check_dim(self.dim, query)?;

        let mut candidates: Vec<Candidate> = match &self.codebooks {
            // Buffering phase: exact scan.
            None => self
                .buffer
                .iter()
                .map(|(id, v)| {
                    Candidate::new(id.clone(), unit_similarity(query, v))
                        .with_metadata(self.meta(id))
                })
                .collect(),
            Some(books) => {
                let table = books.adc_table(query)?;
                self.codes
                    .iter()
                    .map(|(id, code)| {
                        let d = CodebookSet::asym_distance(&table, code);
                        Candidate::new(id.clone(), similarity_from_distance(d))
                            .with_metadata(self.meta(id))
                    })
                    .collect()
            }
        };

        candidates.retain(|c| c.similarity >= opts.min_similarity);
        sort_by_similarity(&mut candidates);
        candidates.truncate(opts.limit as usize);
        Ok(candidates)
    }

    fn meta(&self, id: &str) -> serde_json::Value {
        self.metadata
            .get(id)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn get_stats(&self) -> StrategyStats {
        StrategyStats {
            strategy: "pq".to_string(),
            doc_count: self.buffer.len() + self.codes.len(),
            trained: Some(self.trained()),
            compression_ratio: Some(self.dim as f32 * 4.0 / self.m as f32),
            ..StrategyStats::default()
        }
    }
}
