//! Embedding Capability
//!
//! Embedding generation is an external capability injected at engine
//! construction: the core never imports a model runtime. Any service that
//! maps text to a fixed-dimension vector implements [`Embedder`]; the
//! engine wraps it in an [`EmbeddingGate`] that caps concurrency and bounds
//! latency. A deterministic [`HashEmbedder`] ships as the offline stand-in
//! so every retrieval path works without a model host.
//!
//! Vectors are persisted as little-endian f32 blobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::{AthenaError, Result};

// ============================================================================
// CAPABILITY TRAIT
// ============================================================================

/// External embedding service
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Map text to a fixed-dimension vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    /// Output dimension; fixed per project at first write
    fn dim(&self) -> usize;
    /// Service name, recorded for diagnostics
    fn name(&self) -> &str;
}

// ============================================================================
// GATE
// ============================================================================

/// Concurrency-capped, timeout-bounded wrapper around any embedder
#[derive(Clone)]
pub struct EmbeddingGate {
    inner: Arc<dyn Embedder>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl EmbeddingGate {
    /// Wrap an embedder with a concurrency cap and per-call timeout
    pub fn new(inner: Arc<dyn Embedder>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    /// Embed one text. Failures and timeouts surface as
    /// [`AthenaError::EmbeddingUnavailable`]; callers fall back to the
    /// lexical path and flag the row as degraded.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AthenaError::EmbeddingUnavailable("gate closed".to_string()))?;
        match tokio::time::timeout(self.timeout, self.inner.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(AthenaError::EmbeddingUnavailable(format!(
                "{} timed out after {:?}",
                self.inner.name(),
                self.timeout
            ))),
        }
    }

    /// Output dimension of the wrapped service
    pub fn dim(&self) -> usize {
        self.inner.dim()
    }

    /// Name of the wrapped service
    pub fn name(&self) -> &str {
        self.inner.name()
    }
}

// ============================================================================
// DETERMINISTIC STAND-IN
// ============================================================================

/// Feature-hashed character-trigram embedder
///
/// Deterministic and dependency-free: trigram features are hashed into a
/// fixed number of buckets with a sign bit, then L2-normalized. Texts
/// sharing vocabulary land near each other, which is all the offline and
/// test paths need.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    /// Create with the given output dimension
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

/// FNV-1a over a byte slice
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Deterministic feature-hashed vector for a text: character trigrams
/// into `dim` signed buckets, L2-normalized. The lexical-mode stand-in
/// wherever a real embedding is missing.
pub fn feature_hash(text: &str, dim: usize) -> Vec<f32> {
    let dim = dim.max(8);
    let mut vector = vec![0.0f32; dim];
    let normalized = text.to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return vector;
    }
    for window in chars.windows(3.min(chars.len())) {
        let gram: String = window.iter().collect();
        let hash = fnv1a(gram.as_bytes());
        let bucket = (hash % dim as u64) as usize;
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
    l2_normalize(&mut vector);
    vector
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(feature_hash(text, self.dim))
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &str {
        "hash-trigram"
    }
}

// ============================================================================
// VECTOR MATH AND CODEC
// ============================================================================

/// Cosine similarity between two vectors (0.0 on dimension mismatch)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Normalize a vector to unit length in place
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a vector as a little-endian f32 blob for storage
pub fn to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian f32 blob; `None` when the length is not 4-aligned
pub fn from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

// ============================================================================
// TESTS
// ============================================================================
