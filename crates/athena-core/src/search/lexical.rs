//! Lexical Search Helpers
//!
//! FTS5 query sanitization and the recency boost shared by the hybrid
//! scorer. BM25 scoring itself happens inside SQLite; these helpers keep
//! user text from being parsed as FTS5 syntax and turn SQLite's
//! lower-is-better bm25() output into a higher-is-better score.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Sanitize free text into a safe FTS5 MATCH expression.
///
/// Every token is double-quoted so FTS5 operators (`AND`, `NEAR`, `*`, `-`)
/// in user text are matched literally, then OR-joined for recall.
pub fn sanitize_fts5_query(query: &str) -> String {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    tokens.join(" OR ")
}

/// Convert SQLite's bm25() output (lower is better, can be negative)
/// into a non-negative, higher-is-better score.
pub fn bm25_to_score(bm25: f64) -> f64 {
    // bm25() returns the negated BM25 weight for ranking; invert and floor.
    (-bm25).max(0.0)
}

/// Exponentially decaying recency boost with a configurable half-life.
///
/// 1.0 at `as_of`, 0.5 one half-life ago, approaching 0 beyond.
pub fn recency_boost(last_accessed: DateTime<Utc>, as_of: DateTime<Utc>, halflife: Duration) -> f64 {
    let age = (as_of - last_accessed).num_milliseconds().max(0) as f64 / 1000.0;
    let hl = halflife.as_secs_f64().max(1.0);
    0.5f64.powf(age / hl)
}

/// Tokenize for in-process lexical overlap scoring (judges, fallbacks)
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Term-overlap score between a query and a document in [0,1]:
/// matched query terms / total query terms.
pub fn overlap_score(query: &str, document: &str) -> f64 {
    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let doc_terms: std::collections::HashSet<String> = tokenize(document).into_iter().collect();
    let matched = query_terms
        .iter()
        .filter(|t| doc_terms.contains(*t))
        .count();
    matched as f64 / query_terms.len() as f64
}

// ============================================================================
// TESTS
// ============================================================================
