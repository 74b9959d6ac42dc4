//! Error types shared across the index, storage, and query layers.
//!
//! Every fallible operation returns [`LatticeError`]. The variant set maps
//! one-to-one onto the error kinds surfaced to callers (`kind()` returns the
//! wire name used in HTTP responses and logs). `NotTrained` is advisory:
//! the IVF and PQ strategies downgrade to an exact scan instead of failing,
//! so it only escapes when a caller asks for trained-only behavior.

use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LatticeError>;

#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("cell full: {0}")]
    CellFull(String),

    #[error("shard unavailable: {0}")]
    ShardUnavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("index is not trained yet")]
    NotTrained,
}

impl LatticeError {
    /// Machine-readable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::CellFull(_) => "cell_full",
            Self::ShardUnavailable(_) => "shard_unavailable",
            Self::Timeout(_) => "timeout",
            Self::UnknownStrategy(_) => "unknown_strategy",
            Self::Serialization(_) => "serialization_error",
            Self::Storage(_) => "storage_error",
            Self::NotTrained => "not_trained",
        }
    }

    /// Check an embedding against the configured dimensionality.
    pub fn check_dim(expected: usize, vector: &[f32]) -> Result<()> {
        if vector.len() != expected {
            return Err(Self::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            LatticeError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
            .kind(),
            "dimension_mismatch"
        );
        assert_eq!(LatticeError::NotTrained.kind(), "not_trained");
        assert_eq!(
            LatticeError::UnknownStrategy("flat".into()).kind(),
            "unknown_strategy"
        );
    }

    #[test]
    fn test_check_dim() {
        assert!(LatticeError::check_dim(3, &[1.0, 2.0, 3.0]).is_ok());
        let err = LatticeError::check_dim(3, &[1.0]).unwrap_err();
        match err {
            LatticeError::DimensionMismatch { expected, actual } => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
