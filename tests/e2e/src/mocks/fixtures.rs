//! Test Data Factory and Capability Stand-Ins
//!
//! - [`ScriptedEmbedder`]: returns pre-assigned vectors per exact text,
//!   so tests can decouple vector similarity from lexical overlap
//! - corpus generators for consolidation scenarios (topical clusters and
//!   deliberately unclusterable noise)

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use athena_core::{AthenaError, Embedder};

/// Embedder with a fixed text → vector script; unknown texts get the
/// fallback vector. Never fails, fully deterministic.
pub struct ScriptedEmbedder {
    dim: usize,
    script: Mutex<HashMap<String, Vec<f32>>>,
    fallback: Vec<f32>,
}

impl ScriptedEmbedder {
    /// Create with a dimension; the fallback vector is the first basis
    /// vector so unknown texts are all mutually identical.
    pub fn new(dim: usize) -> Self {
        let mut fallback = vec![0.0; dim];
        fallback[0] = 1.0;
        Self {
            dim,
            script: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    /// Assign a vector to an exact text. Panics on dimension mismatch —
    /// that is a bug in the test, not a runtime condition.
    pub fn assign(&self, text: &str, vector: Vec<f32>) {
        assert_eq!(vector.len(), self.dim, "scripted vector has wrong dim");
        self.script
            .lock()
            .expect("script lock")
            .insert(text.to_string(), vector);
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AthenaError> {
        let script = self.script.lock().expect("script lock");
        Ok(script.get(text).cloned().unwrap_or_else(|| self.fallback.clone()))
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// `clusters x per_cluster` event contents forming tight topical groups.
pub fn clustered_corpus(clusters: usize, per_cluster: usize) -> Vec<(String, Vec<String>)> {
    const TOPICS: &[(&str, &str)] = &[
        ("deploy", "deploy service alpha to the staging environment"),
        ("backup", "database backup for the orders cluster"),
        ("oncall", "oncall page about elevated api latency"),
        ("review", "code review feedback on the billing branch"),
        ("incident", "incident timeline entry for the cache outage"),
        ("migrate", "migrate the search index to the new schema"),
        ("scale", "scale the worker pool for the nightly jobs"),
    ];

    let mut out = Vec::with_capacity(clusters * per_cluster);
    for c in 0..clusters {
        let (tag, base) = TOPICS[c % TOPICS.len()];
        for i in 0..per_cluster {
            out.push((
                format!("{base} update number {i}"),
                vec![tag.to_string()],
            ));
        }
    }
    out
}

/// `count` deliberately unrelated contents that no density clustering
/// should group: every string draws from disjoint word pools plus a
/// unique numeric token.
pub fn noise_corpus(count: usize) -> Vec<String> {
    const A: &[&str] = &[
        "umbrella", "saxophone", "glacier", "pretzel", "volcano", "origami", "lantern", "walrus",
        "mosaic", "thimble", "quasar", "bagpipe", "tundra",
    ];
    const B: &[&str] = &[
        "whisper", "gallop", "flicker", "rummage", "quiver", "sprint", "mumble", "drift",
        "scatter", "wobble", "trudge",
    ];
    const C: &[&str] = &[
        "crimson", "amber", "violet", "teal", "ochre", "indigo", "maroon",
    ];

    (0..count)
        .map(|i| {
            format!(
                "{} {} {} token{}",
                A[i % A.len()],
                B[i % B.len()],
                C[i % C.len()],
                i * 31 + 7
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_embedder() {
        let embedder = ScriptedEmbedder::new(3);
        embedder.assign("known", vec![0.0, 1.0, 0.0]);
        assert_eq!(embedder.embed("known").await.unwrap(), vec![0.0, 1.0, 0.0]);
        assert_eq!(embedder.embed("unknown").await.unwrap(), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_corpora_sizes() {
        assert_eq!(clustered_corpus(5, 20).len(), 100);
        let noise = noise_corpus(100);
        assert_eq!(noise.len(), 100);
        // All distinct.
        let unique: std::collections::HashSet<&String> = noise.iter().collect();
        assert_eq!(unique.len(), 100);
    }
}
