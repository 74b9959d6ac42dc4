//! Ranking pipeline: pluggable scorers and rank fusion.
//!
//! A [`Ranker`] runs every [`Scorer`] over the candidate set, fuses the
//! per-scorer scores into `final_score`, drops candidates below
//! `min_score`, and sorts descending. Fusion variants:
//!
//! - `weighted_sum` — `Σ w(s) · score(s)`, missing scores count as 0
//! - `rrf` — reciprocal rank fusion, `Σ 1/(60 + rank)` per scorer ranking
//! - `max` — `max w(s) · score(s)`
//! - custom — caller-supplied function over the score map
//!
//! Built-in scorers: vector similarity, PageRank over an optional
//! document-link graph, freshness (30-day half-life on
//! `metadata.timestamp`), and a BM25-flavoured text match.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{sort_by_final_score, Candidate};

/// Per-query context shared by all scorers.
#[derive(Debug, Clone, Default)]
pub struct ScoreContext {
    pub query: String,
    pub query_terms: Vec<String>,
    /// Unix timestamp the query executes at.
    pub now_ts: i64,
    /// Precomputed PageRank per document id, when a link graph exists.
    pub link_ranks: Option<HashMap<String, f32>>,
    /// Mean candidate text length, for BM25 length normalization.
    pub avg_text_len: f32,
}

impl ScoreContext {
    pub fn for_query(query: &str, now_ts: i64) -> Self {
        Self {
            query: query.to_string(),
            query_terms: extract_terms(query),
            now_ts,
            link_ranks: None,
            avg_text_len: 0.0,
        }
    }
}

/// Lowercased word-character terms longer than two characters.
pub fn extract_terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;
    fn weight(&self) -> f32;
    fn score(&self, candidate: &Candidate, ctx: &ScoreContext) -> f32;
}

/// Passes through the vector similarity attached at gather time.
pub struct VectorSimilarity {
    pub weight: f32,
}

impl Scorer for VectorSimilarity {
    fn name(&self) -> &str {
        "vector_similarity"
    }
    fn weight(&self) -> f32 {
        self.weight
    }
    fn score(&self, candidate: &Candidate, _ctx: &ScoreContext) -> f32 {
        candidate.similarity
    }
}

/// PageRank over the document-link graph, 0 when no graph is present.
pub struct PageRank {
    pub weight: f32,
}

impl Scorer for PageRank {
    fn name(&self) -> &str {
        "pagerank"
    }
    fn weight(&self) -> f32 {
        self.weight
    }
    fn score(&self, candidate: &Candidate, ctx: &ScoreContext) -> f32 {
        let Some(ranks) = &ctx.link_ranks else {
            return 0.0;
        };
        let key = candidate.doc_id.as_deref().unwrap_or(&candidate.id);
        ranks.get(key).copied().unwrap_or(0.0)
    }
}

/// Iterative PageRank (damping 0.85, 20 rounds) over `doc → links`.
pub fn compute_pagerank(graph: &HashMap<String, Vec<String>>) -> HashMap<String, f32> {
    let mut nodes: Vec<&String> = graph.keys().collect();
    for targets in graph.values() {
        for t in targets {
            if !graph.contains_key(t) {
                nodes.push(t);
            }
        }
    }
    nodes.sort();
    nodes.dedup();

    let n = nodes.len();
    if n == 0 {
        return HashMap::new();
    }

    const DAMPING: f32 = 0.85;
    let base = (1.0 - DAMPING) / n as f32;
    let mut ranks: HashMap<&str, f32> =
        nodes.iter().map(|id| (id.as_str(), 1.0 / n as f32)).collect();

    for _ in 0..20 {
        let mut next: HashMap<&str, f32> = nodes.iter().map(|id| (id.as_str(), base)).collect();
        for (source, targets) in graph {
            if targets.is_empty() {
                continue;
            }
            let share = DAMPING * ranks[source.as_str()] / targets.len() as f32;
            for t in targets {
                if let Some(r) = next.get_mut(t.as_str()) {
                    *r += share;
                }
            }
        }
        ranks = next;
    }

    ranks.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Exponential decay with a 30-day half-life on `metadata.timestamp`
/// (unix seconds). Documents without a timestamp score 0.
pub struct Freshness {
    pub weight: f32,
}

const HALF_LIFE_SECS: f64 = 30.0 * 86_400.0;

impl Scorer for Freshness {
    fn name(&self) -> &str {
        "freshness"
    }
    fn weight(&self) -> f32 {
        self.weight
    }
    fn score(&self, candidate: &Candidate, ctx: &ScoreContext) -> f32 {
        let Some(ts) = candidate.metadata.get("timestamp").and_then(|v| v.as_i64()) else {
            return 0.0;
        };
        let age = (ctx.now_ts - ts).max(0) as f64;
        (0.5f64.powf(age / HALF_LIFE_SECS)) as f32
    }
}

/// BM25-flavoured term overlap between the query and the candidate text.
///
/// No corpus-wide document frequencies are available at ranking time, so
/// every matched term contributes a saturated TF component with standard
/// `k1 = 1.2`, `b = 0.75` length normalization against the mean candidate
/// length, scaled into `[0, 1]` by the query term count.
pub struct TextMatch {
    pub weight: f32,
}

impl Scorer for TextMatch {
    fn name(&self) -> &str {
        "text_match"
    }
    fn weight(&self) -> f32 {
        self.weight
    }
    fn score(&self, candidate: &Candidate, ctx: &ScoreContext) -> f32 {
        let Some(text) = &candidate.text else {
            return 0.0;
        };
        if ctx.query_terms.is_empty() {
            return 0.0;
        }

        const K1: f32 = 1.2;
        const B: f32 = 0.75;

        let doc_terms = extract_terms(text);
        let len_ratio = if ctx.avg_text_len > 0.0 {
            doc_terms.len() as f32 / ctx.avg_text_len
        } else {
            1.0
        };

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for t in &doc_terms {
            *tf.entry(t.as_str()).or_default() += 1.0;
        }

        let mut total = 0.0;
        for term in &ctx.query_terms {
            let f = tf.get(term.as_str()).copied().unwrap_or(0.0);
            if f > 0.0 {
                total += f * (K1 + 1.0) / (f + K1 * (1.0 - B + B * len_ratio));
            }
        }
        total / (ctx.query_terms.len() as f32 * (K1 + 1.0))
    }
}

/// How per-scorer scores collapse into `final_score`.
#[derive(Clone)]
pub enum Fusion {
    WeightedSum,
    Rrf,
    Max,
    Custom(Arc<dyn Fn(&HashMap<String, f32>) -> f32 + Send + Sync>),
}

impl Fusion {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weighted_sum" => Some(Self::WeightedSum),
            "rrf" => Some(Self::Rrf),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightedSum => "weighted_sum",
            Self::Rrf => "rrf",
            Self::Max => "max",
            Self::Custom(_) => "custom",
        }
    }
}

const RRF_K: f32 = 60.0;

pub struct Ranker {
    pub scorers: Vec<Box<dyn Scorer>>,
    /// Per-scorer weight overrides; a scorer's own weight applies when
    /// absent.
    pub weights: Option<HashMap<String, f32>>,
    pub fusion: Fusion,
    pub min_score: f32,
}

impl Default for Ranker {
    fn default() -> Self {
        Self {
            scorers: vec![
                Box::new(VectorSimilarity { weight: 1.0 }),
                Box::new(TextMatch { weight: 0.3 }),
                Box::new(Freshness { weight: 0.1 }),
                Box::new(PageRank { weight: 0.1 }),
            ],
            weights: None,
            fusion: Fusion::WeightedSum,
            min_score: 0.0,
        }
    }
}

impl Ranker {
    /// A ranker that only considers vector similarity (the
    /// `force_engine: vector_search` path).
    pub fn vector_only() -> Self {
        Self {
            scorers: vec![Box::new(VectorSimilarity { weight: 1.0 })],
            weights: None,
            fusion: Fusion::WeightedSum,
            min_score: 0.0,
        }
    }

    fn weight_of(&self, scorer: &dyn Scorer) -> f32 {
        self.weights
            .as_ref()
            .and_then(|w| w.get(scorer.name()).copied())
            .unwrap_or_else(|| scorer.weight())
    }

    /// Names and effective weights, in scorer order (cache-key input).
    pub fn weight_vector(&self) -> Vec<(String, f32)> {
        self.scorers
            .iter()
            .map(|s| (s.name().to_string(), self.weight_of(s.as_ref())))
            .collect()
    }

    /// Score, fuse, filter, and sort candidates.
    pub fn rank(&self, mut candidates: Vec<Candidate>, ctx: &ScoreContext) -> Vec<Candidate> {
        let mut ctx = ctx.clone();
        if ctx.avg_text_len == 0.0 {
            let lens: Vec<usize> = candidates
                .iter()
                .filter_map(|c| c.text.as_ref().map(|t| extract_terms(t).len()))
                .collect();
            if !lens.is_empty() {
                ctx.avg_text_len = lens.iter().sum::<usize>() as f32 / lens.len() as f32;
            }
        }

        for cand in candidates.iter_mut() {
            for scorer in &self.scorers {
                let s = scorer.score(cand, &ctx);
                cand.scores.insert(scorer.name().to_string(), s);
            }
        }

        match &self.fusion {
            Fusion::WeightedSum => {
                for cand in candidates.iter_mut() {
                    cand.final_score = self
                        .scorers
                        .iter()
                        .map(|s| {
                            self.weight_of(s.as_ref())
                                * cand.scores.get(s.name()).copied().unwrap_or(0.0)
                        })
                        .sum();
                }
            }
            Fusion::Max => {
                for cand in candidates.iter_mut() {
                    cand.final_score = self
                        .scorers
                        .iter()
                        .map(|s| {
                            self.weight_of(s.as_ref())
                                * cand.scores.get(s.name()).copied().unwrap_or(0.0)
                        })
                        .fold(f32::NEG_INFINITY, f32::max)
                        .max(0.0);
                }
            }
            Fusion::Rrf => {
                let mut fused: HashMap<String, f32> = HashMap::new();
                for scorer in &self.scorers {
                    let mut order: Vec<(String, f32)> = candidates
                        .iter()
                        .map(|c| {
                            (
                                c.id.clone(),
                                c.scores.get(scorer.name()).copied().unwrap_or(0.0),
                            )
                        })
                        .collect();
                    order.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    for (rank, (id, _)) in order.iter().enumerate() {
                        *fused.entry(id.clone()).or_default() +=
                            1.0 / (RRF_K + (rank + 1) as f32);
                    }
                }
                for cand in candidates.iter_mut() {
                    cand.final_score = fused.get(&cand.id).copied().unwrap_or(0.0);
                }
            }
            Fusion::Custom(f) => {
                for cand in candidates.iter_mut() {
                    cand.final_score = f(&cand.scores);
                }
            }
        }

        candidates.retain(|c| c.final_score >= self.min_score);
        sort_by_final_score(&mut candidates);
        candidates
    }
}
