//! Hybrid Ranking
//!
//! Blends vector similarity, lexical relevance, and recency into one
//! deterministic score:
//!
//! `score = alpha * norm(vec_sim) + (1 - alpha) * norm(lex_score)
//!          + beta * recency_boost(last_accessed)`
//!
//! Normalization is min-max over the candidate set, so the blend is scale
//! free across FTS5 and cosine outputs. Ties break by higher confidence,
//! then lower id, making identical inputs produce identical rankings.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::lexical::recency_boost;
use crate::types::MemoryId;

/// Blend weights for hybrid scoring
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    /// Vector/lexical blend in [0,1]; 1.0 = vector only
    pub alpha: f64,
    /// Recency boost weight
    pub beta: f64,
    /// Recency decay half-life
    pub halflife: Duration,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            beta: 0.1,
            halflife: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// One retrieval candidate before blending
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Row id
    pub id: MemoryId,
    /// Cosine similarity, when the row has an embedding
    pub vec_sim: Option<f64>,
    /// Lexical (BM25) score, when the row matched the FTS query
    pub lex_score: Option<f64>,
    /// Last access time for the recency boost
    pub last_accessed: DateTime<Utc>,
    /// Confidence used as the first tie-breaker
    pub confidence: f64,
}

/// A candidate with its blended score
#[derive(Debug, Clone)]
pub struct Blended {
    /// Row id
    pub id: MemoryId,
    /// Final blended score
    pub score: f64,
    /// Normalized vector component (diagnostics)
    pub vec_component: f64,
    /// Normalized lexical component (diagnostics)
    pub lex_component: f64,
}

fn min_max(values: &[Option<f64>]) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for v in values.iter().flatten() {
        lo = lo.min(*v);
        hi = hi.max(*v);
    }
    (lo, hi)
}

fn normalize(value: Option<f64>, lo: f64, hi: f64) -> f64 {
    match value {
        None => 0.0,
        Some(v) => {
            if !lo.is_finite() || !hi.is_finite() {
                0.0
            } else if (hi - lo).abs() < f64::EPSILON {
                // Every present score identical: full credit for matching at all.
                1.0
            } else {
                (v - lo) / (hi - lo)
            }
        }
    }
}

/// Blend candidates into a deterministic descending ranking.
pub fn blend(candidates: &[Candidate], weights: HybridWeights, as_of: DateTime<Utc>) -> Vec<Blended> {
    let vec_scores: Vec<Option<f64>> = candidates.iter().map(|c| c.vec_sim).collect();
    let lex_scores: Vec<Option<f64>> = candidates.iter().map(|c| c.lex_score).collect();
    let (vec_lo, vec_hi) = min_max(&vec_scores);
    let (lex_lo, lex_hi) = min_max(&lex_scores);

    let mut out: Vec<(Blended, f64)> = candidates
        .iter()
        .map(|c| {
            let vec_component = normalize(c.vec_sim, vec_lo, vec_hi);
            let lex_component = normalize(c.lex_score, lex_lo, lex_hi);
            let recency = recency_boost(c.last_accessed, as_of, weights.halflife);
            let score = weights.alpha * vec_component
                + (1.0 - weights.alpha) * lex_component
                + weights.beta * recency;
            (
                Blended {
                    id: c.id,
                    score,
                    vec_component,
                    lex_component,
                },
                c.confidence,
            )
        })
        .collect();

    out.sort_by(|(a, conf_a), (b, conf_b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                conf_b
                    .partial_cmp(conf_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });

    out.into_iter().map(|(b, _)| b).collect()
}

// ============================================================================
// TESTS
// ============================================================================
