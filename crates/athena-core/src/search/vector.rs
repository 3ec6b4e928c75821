//! In-Memory Vector Index
//!
//! Exact cosine search over the embeddings of one layer. Vectors are
//! normalized on insert so search is a dot-product scan; results are fully
//! deterministic (score descending, id ascending on ties), which the hybrid
//! ranking contract requires. Rebuilt from stored blobs at open.

use std::collections::HashMap;

use crate::embedding::l2_normalize;
use crate::types::MemoryId;

/// Exact-scan cosine index for one layer
pub struct VectorIndex {
    dim: usize,
    vectors: HashMap<MemoryId, Vec<f32>>,
}

impl VectorIndex {
    /// Create an empty index for the given dimension
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: HashMap::new(),
        }
    }

    /// Vector dimension this index accepts
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Whether the index holds no vectors
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Insert or replace a vector. Mismatched dimensions are skipped so a
    /// project whose embedder changed mid-life degrades instead of panicking.
    pub fn add(&mut self, id: MemoryId, vector: &[f32]) -> bool {
        if vector.len() != self.dim {
            tracing::warn!(
                "skipping vector for {}: dim {} != index dim {}",
                id,
                vector.len(),
                self.dim
            );
            return false;
        }
        let mut v = vector.to_vec();
        l2_normalize(&mut v);
        self.vectors.insert(id, v);
        true
    }

    /// Remove a vector by id
    pub fn remove(&mut self, id: MemoryId) -> bool {
        self.vectors.remove(&id).is_some()
    }

    /// Top-k ids by cosine similarity, filtered by `keep`.
    ///
    /// `k = 0` returns an empty list; `k > len` returns everything in the
    /// same order a larger `k` would.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        keep: impl Fn(MemoryId) -> bool,
    ) -> Vec<(MemoryId, f32)> {
        if k == 0 || query.len() != self.dim {
            return Vec::new();
        }
        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(MemoryId, f32)> = self
            .vectors
            .iter()
            .filter(|(id, _)| keep(**id))
            .map(|(id, v)| {
                let dot: f32 = q.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
                (*id, dot)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

// ============================================================================
// TESTS
// ============================================================================
