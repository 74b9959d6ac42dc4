//! Embedding provider abstraction and vector codecs.
//!
//! The embedding model is an external collaborator: an opaque function
//! `text → Vec<f32>`. Three providers are shipped:
//!
//! - **`hashed`** — deterministic, dependency-free vectors derived from a
//!   SHA-256 of the text. Not semantically meaningful, but stable across
//!   runs; the default for local development and tests.
//! - **`http`** — POSTs `{model, input: [texts]}` to a configured
//!   endpoint and expects `{embeddings: [[f32]]}` back, with exponential
//!   backoff on 429/5xx and network errors.
//! - **`disabled`** — always errors.
//!
//! Also provides the BLOB codecs used for SQLite storage:
//! [`vec_to_blob`] / [`blob_to_vec`] (little-endian `f32` bytes).

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{LatticeError, Result};

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Embed a batch of texts using the configured provider.
///
/// Returns one vector of `dim` components per input text, in order.
pub async fn encode_batch(
    config: &EmbeddingConfig,
    dim: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    match config.provider.as_str() {
        "hashed" => Ok(texts.iter().map(|t| hashed_embedding(t, dim)).collect()),
        "http" => encode_http(config, dim, texts).await,
        "disabled" => Err(LatticeError::InvalidInput(
            "embedding provider is disabled".to_string(),
        )),
        other => Err(LatticeError::InvalidInput(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Embed a single query text.
pub async fn encode_one(config: &EmbeddingConfig, dim: usize, text: &str) -> Result<Vec<f32>> {
    let results = encode_batch(config, dim, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| LatticeError::InvalidInput("empty embedding response".to_string()))
}

/// Deterministic unit vector derived from a SHA-256 of the text.
///
/// The digest seeds an xorshift generator that fills `dim` components in
/// `[-1, 1]`; the result is L2-normalized. Identical text always maps to
/// the identical vector.
pub fn hashed_embedding(text: &str, dim: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut state = u64::from_le_bytes(digest[..8].try_into().unwrap()) | 1;

    let mut v: Vec<f32> = (0..dim)
        .map(|_| {
            // xorshift64*
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let r = state.wrapping_mul(0x2545F4914F6CDD1D);
            (r >> 11) as f32 / (1u64 << 53) as f32 * 2.0 - 1.0
        })
        .collect();

    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

#[derive(Deserialize)]
struct HttpEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

async fn encode_http(
    config: &EmbeddingConfig,
    dim: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let endpoint = config.endpoint.as_deref().ok_or_else(|| {
        LatticeError::InvalidInput("embedding.endpoint required for http provider".to_string())
    })?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| LatticeError::InvalidInput(format!("http client: {e}")))?;

    let body = serde_json::json!({
        "model": config.model,
        "input": texts,
    });

    let mut attempt = 0u32;
    loop {
        let response = client.post(endpoint).json(&body).send().await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let parsed: HttpEmbeddingResponse = resp
                    .json()
                    .await
                    .map_err(|e| LatticeError::Serialization(e.to_string()))?;
                if parsed.embeddings.len() != texts.len() {
                    return Err(LatticeError::InvalidInput(format!(
                        "embedding endpoint returned {} vectors for {} texts",
                        parsed.embeddings.len(),
                        texts.len()
                    )));
                }
                for v in &parsed.embeddings {
                    LatticeError::check_dim(dim, v)?;
                }
                return Ok(parsed.embeddings);
            }
            Ok(resp) => {
                let status = resp.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || attempt >= config.max_retries {
                    return Err(LatticeError::InvalidInput(format!(
                        "embedding endpoint returned {status}"
                    )));
                }
            }
            Err(e) => {
                if attempt >= config.max_retries {
                    return Err(LatticeError::InvalidInput(format!(
                        "embedding request failed: {e}"
                    )));
                }
            }
        }

        let delay = Duration::from_secs(1 << attempt.min(5));
        warn!(attempt, ?delay, "retrying embedding request");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn test_hashed_deterministic() {
        let a = hashed_embedding("hello world", 16);
        let b = hashed_embedding("hello world", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hashed_distinct_texts_differ() {
        let a = hashed_embedding("hello", 16);
        let b = hashed_embedding("goodbye", 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hashed_unit_norm() {
        let v = hashed_embedding("normalize me", 32);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let config = EmbeddingConfig {
            provider: "disabled".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = encode_batch(&config, 4, &["x".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_hashed_batch_order_preserved() {
        let config = EmbeddingConfig::default();
        let texts = vec!["a".to_string(), "b".to_string()];
        let out = encode_batch(&config, 8, &texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], hashed_embedding("a", 8));
        assert_eq!(out[1], hashed_embedding("b", 8));
    }
}
