//! Binary encoding of dense vectors and the Hamming kernel.
//!
//! A [`BinaryQuantizer`] turns an `f32` vector into a `B`-bit code where
//! bit `i` is set iff `vec[i mod D]` exceeds the per-component threshold.
//! Thresholds come from one of three modes:
//!
//! - `mean` — running per-component mean over every observed vector
//! - `median` — per-component median over a reservoir sample
//! - `learned` — frozen from the first `training_size` vectors
//!
//! [`hamming`] operates on 64-bit lanes with a masked remainder tail and
//! is bit-for-bit deterministic on identical inputs.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};

const RESERVOIR_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryMode {
    Mean,
    Median,
    Learned,
}

impl BinaryMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            "learned" => Ok(Self::Learned),
            other => Err(LatticeError::InvalidInput(format!(
                "unknown binary mode: {other}"
            ))),
        }
    }
}

/// A fixed-width bitstring packed into 64-bit lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryCode {
    bits: usize,
    words: Vec<u64>,
}

impl BinaryCode {
    pub fn zeroed(bits: usize) -> Self {
        Self {
            bits,
            words: vec![0u64; bits.div_ceil(64)],
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.bits);
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.bits);
        self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    /// Bitwise complement within the code width.
    pub fn complement(&self) -> Self {
        let mut out = Self {
            bits: self.bits,
            words: self.words.iter().map(|w| !w).collect(),
        };
        mask_tail(&mut out);
        out
    }
}

fn mask_tail(code: &mut BinaryCode) {
    let rem = code.bits % 64;
    if rem != 0 {
        if let Some(last) = code.words.last_mut() {
            *last &= (1u64 << rem) - 1;
        }
    }
}

/// Hamming distance between two codes of equal width.
///
/// XOR-plus-popcount over full 64-bit lanes; the final partial lane is
/// masked to the remaining bits so stray high bits never count.
pub fn hamming(a: &BinaryCode, b: &BinaryCode) -> u32 {
    debug_assert_eq!(a.bits, b.bits);
    let full_lanes = a.bits / 64;
    let mut total = 0u32;

    for i in 0..full_lanes {
        total += (a.words[i] ^ b.words[i]).count_ones();
    }

    let rem = a.bits % 64;
    if rem != 0 {
        let mask = (1u64 << rem) - 1;
        total += ((a.words[full_lanes] ^ b.words[full_lanes]) & mask).count_ones();
    }

    total
}

/// Stateful threshold estimator plus encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryQuantizer {
    mode: BinaryMode,
    bits: usize,
    dim: usize,
    training_size: usize,
    count: u64,
    sums: Vec<f64>,
    reservoir: Vec<Vec<f32>>,
    learned: Option<Vec<f32>>,
}

impl BinaryQuantizer {
    pub fn new(mode: BinaryMode, bits: usize, dim: usize, training_size: usize) -> Self {
        Self {
            mode,
            bits,
            dim,
            training_size: training_size.max(1),
            count: 0,
            sums: vec![0.0; dim],
            reservoir: Vec::new(),
            learned: None,
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Fold one vector into the threshold state.
    pub fn observe(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim);
        self.count += 1;
        for (s, x) in self.sums.iter_mut().zip(vector.iter()) {
            *s += f64::from(*x);
        }

        // Reservoir sample (algorithm R) feeding the median mode.
        if self.reservoir.len() < RESERVOIR_CAPACITY {
            self.reservoir.push(vector.to_vec());
        } else {
            let j = rand::thread_rng().gen_range(0..self.count as usize);
            if j < RESERVOIR_CAPACITY {
                self.reservoir[j] = vector.to_vec();
            }
        }

        if self.mode == BinaryMode::Learned
            && self.learned.is_none()
            && self.count as usize >= self.training_size
        {
            self.learned = Some(self.mean_thresholds());
        }
    }

    fn mean_thresholds(&self) -> Vec<f32> {
        if self.count == 0 {
            return vec![0.0; self.dim];
        }
        self.sums
            .iter()
            .map(|s| (s / self.count as f64) as f32)
            .collect()
    }

    fn median_thresholds(&self) -> Vec<f32> {
        if self.reservoir.is_empty() {
            return vec![0.0; self.dim];
        }
        (0..self.dim)
            .map(|c| {
                let mut column: Vec<f32> = self.reservoir.iter().map(|v| v[c]).collect();
                column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                column[column.len() / 2]
            })
            .collect()
    }

    fn thresholds(&self) -> Vec<f32> {
        match self.mode {
            BinaryMode::Mean => self.mean_thresholds(),
            BinaryMode::Median => self.median_thresholds(),
            // Falls back to the running mean until training completes.
            BinaryMode::Learned => self
                .learned
                .clone()
                .unwrap_or_else(|| self.mean_thresholds()),
        }
    }

    /// Encode a vector against the current thresholds.
    pub fn encode(&self, vector: &[f32]) -> BinaryCode {
        let thresholds = self.thresholds();
        let mut code = BinaryCode::zeroed(self.bits);
        for i in 0..self.bits {
            let c = i % self.dim;
            if vector[c] > thresholds[c] {
                code.set(i);
            }
        }
        code
    }
}
