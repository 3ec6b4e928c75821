//! Search Primitives
//!
//! Shared retrieval machinery used by the semantic and episodic layers and
//! the retrieval pipeline:
//! - Exact-scan vector index rebuilt from stored blobs
//! - FTS5 sanitization and BM25 score handling
//! - Deterministic hybrid blending (vector + lexical + recency)
//! - Hypothetical-answer query expansion

pub mod hybrid;
pub mod hyde;
pub mod lexical;
pub mod vector;

pub use hybrid::{blend, Blended, Candidate, HybridWeights};
pub use hyde::{analyze, centroid_embedding, expand_query, QueryCues};
pub use lexical::{bm25_to_score, overlap_score, recency_boost, sanitize_fts5_query, tokenize};
pub use vector::VectorIndex;
