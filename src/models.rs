//! Core data models used throughout Lattice.
//!
//! These types represent the documents, chunks, shards, and ranked
//! candidates that flow through the indexing and query pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A document as submitted by the caller. A duplicate `id` is an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Granularity of a chunk within the document hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLevel {
    Document,
    Paragraph,
    Sentence,
}

impl ChunkLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Paragraph => "paragraph",
            Self::Sentence => "sentence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(Self::Document),
            "paragraph" => Some(Self::Paragraph),
            "sentence" => Some(Self::Sentence),
            _ => None,
        }
    }
}

/// A chunk of a document at one level of the hierarchy.
///
/// `start_offset`/`end_offset` are byte positions in the **document** text,
/// which keeps `{doc_id}:{p|s}:{start}` ids globally unique; `parent_id`
/// alone carries the hierarchy (sentence → paragraph → document).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub parent_id: Option<String>,
    pub level: ChunkLevel,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Metadata describing one shard, as tracked by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: String,
    pub path: String,
    pub doc_count: i64,
    pub query_count: i64,
    pub centroid: Vec<f32>,
    pub centroid_norm: f32,
}

/// A ranked search candidate flowing through the query pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Vector similarity in `[0, 1]`.
    pub similarity: f32,
    /// Per-scorer scores attached by the ranking pipeline.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub scores: HashMap<String, f32>,
    #[serde(default)]
    pub final_score: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Grounding provenance, attached when context expansion is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding: Option<Reference>,
}

impl Candidate {
    /// A bare candidate carrying only an id and a similarity.
    pub fn new(id: impl Into<String>, similarity: f32) -> Self {
        Self {
            id: id.into(),
            doc_id: None,
            text: None,
            similarity,
            scores: HashMap::new(),
            final_score: 0.0,
            metadata: serde_json::Value::Null,
            grounding: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Provenance for a grounded result: where in which document the match
/// came from, plus the surrounding parent text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub doc_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub parent_context: String,
}

/// Receipt returned by the indexer for a successfully indexed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReceipt {
    pub id: String,
    pub shard_id: String,
    pub status: String,
}

/// Sort candidates by descending similarity, ties broken by ascending id.
///
/// This is the canonical result ordering shared by every strategy.
pub fn sort_by_similarity(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Sort candidates by descending fused score, ties broken by ascending id.
pub fn sort_by_final_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
