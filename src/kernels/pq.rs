//! Product-quantization codebooks: training, encoding, and asymmetric
//! distance computation (ADC).
//!
//! A vector of dimension `D` is split into `M` sub-vectors of `D/M`
//! components; each sub-space gets its own k-means codebook of `K ≤ 256`
//! centroids, so a vector compresses to `M` bytes. Queries stay full
//! precision: a per-query `M × K` table of sub-distances makes scoring a
//! code `M` table lookups plus adds.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::kernels::distance::l2_sq;
use crate::kernels::kmeans::{kmeans, nearest_centroid};

/// Trained PQ codebooks for one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodebookSet {
    pub dim: usize,
    pub m: usize,
    pub k: usize,
    pub sub_dim: usize,
    /// `codebooks[s][c]` is centroid `c` of sub-space `s`.
    pub codebooks: Vec<Vec<Vec<f32>>>,
}

impl CodebookSet {
    /// Train `m` codebooks of `k` centroids via independent k-means per
    /// sub-space.
    ///
    /// Fails with `invalid_input` if `dim % m != 0`, `k > 256`, or the
    /// training set is empty.
    pub fn train<R: Rng>(vectors: &[Vec<f32>], m: usize, k: usize, rng: &mut R) -> Result<Self> {
        if vectors.is_empty() {
            return Err(LatticeError::InvalidInput(
                "PQ training requires at least one vector".to_string(),
            ));
        }
        if k == 0 || k > 256 {
            return Err(LatticeError::InvalidInput(format!(
                "PQ centroid count must be in 1..=256, got {k}"
            )));
        }
        let dim = vectors[0].len();
        if m == 0 || dim % m != 0 {
            return Err(LatticeError::InvalidInput(format!(
                "dimension {dim} is not divisible into {m} sub-vectors"
            )));
        }
        let sub_dim = dim / m;

        let mut codebooks = Vec::with_capacity(m);
        for s in 0..m {
            let lo = s * sub_dim;
            let hi = lo + sub_dim;
            let subs: Vec<Vec<f32>> = vectors.iter().map(|v| v[lo..hi].to_vec()).collect();
            codebooks.push(kmeans(&subs, k, rng).centroids);
        }

        Ok(Self {
            dim,
            m,
            k,
            sub_dim,
            codebooks,
        })
    }

    /// Encode a vector as `m` centroid indices.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        LatticeError::check_dim(self.dim, vector)?;
        let mut code = Vec::with_capacity(self.m);
        for s in 0..self.m {
            let lo = s * self.sub_dim;
            let sub = &vector[lo..lo + self.sub_dim];
            code.push(nearest_centroid(sub, &self.codebooks[s]) as u8);
        }
        Ok(code)
    }

    /// Reconstruct the centroid approximation of a code.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        for (s, &c) in code.iter().enumerate() {
            out.extend_from_slice(&self.codebooks[s][c as usize]);
        }
        out
    }

    /// Precompute the per-sub-space distance table for one query.
    ///
    /// `table[s][c]` = squared distance from the query's sub-vector `s`
    /// to centroid `c`.
    pub fn adc_table(&self, query: &[f32]) -> Result<Vec<Vec<f32>>> {
        LatticeError::check_dim(self.dim, query)?;
        let mut table = Vec::with_capacity(self.m);
        for s in 0..self.m {
            let lo = s * self.sub_dim;
            let sub = &query[lo..lo + self.sub_dim];
            table.push(
                self.codebooks[s]
                    .iter()
                    .map(|c| l2_sq(sub, c))
                    .collect::<Vec<f32>>(),
            );
        }
        Ok(table)
    }

    /// Asymmetric distance of a code against a precomputed table.
    pub fn asym_distance(table: &[Vec<f32>], code: &[u8]) -> f32 {
        code.iter()
            .enumerate()
            .map(|(s, &c)| table[s][c as usize])
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn training_set() -> Vec<Vec<f32>> {
        let mut vectors = Vec::new();
        for i in 0..32 {
            let x = (i % 4) as f32;
            vectors.push(vec![x, x + 0.1, 10.0 - x, 10.0 - x - 0.1]);
        }
        vectors
    }

    #[test]
    fn test_train_rejects_indivisible_dim() {
        let vectors = vec![vec![1.0, 2.0, 3.0]];
        let mut rng = StdRng::seed_from_u64(3);
        assert!(CodebookSet::train(&vectors, 2, 4, &mut rng).is_err());
    }

    #[test]
    fn test_train_rejects_oversized_k() {
        let vectors = vec![vec![1.0, 2.0]];
        let mut rng = StdRng::seed_from_u64(3);
        assert!(CodebookSet::train(&vectors, 2, 300, &mut rng).is_err());
    }

    #[test]
    fn test_encode_len_and_range() {
        let mut rng = StdRng::seed_from_u64(5);
        let books = CodebookSet::train(&training_set(), 2, 4, &mut rng).unwrap();
        let code = books.encode(&[1.0, 1.1, 9.0, 8.9]).unwrap();
        assert_eq!(code.len(), 2);
        for &c in &code {
            assert!((c as usize) < 4);
        }
    }

    #[test]
    fn test_encode_dimension_mismatch() {
        let mut rng = StdRng::seed_from_u64(5);
        let books = CodebookSet::train(&training_set(), 2, 4, &mut rng).unwrap();
        let err = books.encode(&[1.0, 2.0]).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn test_adc_matches_decoded_distance() {
        let mut rng = StdRng::seed_from_u64(5);
        let books = CodebookSet::train(&training_set(), 2, 4, &mut rng).unwrap();
        let query = vec![2.0, 2.1, 8.0, 7.9];
        let target = vec![1.0, 1.1, 9.0, 8.9];

        let code = books.encode(&target).unwrap();
        let table = books.adc_table(&query).unwrap();
        let adc = CodebookSet::asym_distance(&table, &code);
        let exact = l2_sq(&query, &books.decode(&code));
        assert!((adc - exact).abs() < 1e-4);
    }

    #[test]
    fn test_reconstruction_error_bounded_by_training_spread() {
        let vectors = training_set();
        let mut rng = StdRng::seed_from_u64(9);
        let books = CodebookSet::train(&vectors, 2, 4, &mut rng).unwrap();
        // With 4 distinct patterns and 4 centroids per sub-space the
        // codebooks reproduce the training set almost exactly.
        for v in &vectors {
            let code = books.encode(v).unwrap();
            let err = l2_sq(v, &books.decode(&code));
            assert!(err < 0.1, "reconstruction error {err} too large");
        }
    }
}
