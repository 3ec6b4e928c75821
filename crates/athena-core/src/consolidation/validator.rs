//! Cluster Validation (System 2)
//!
//! The slow path of dual-process consolidation: clusters whose uncertainty
//! exceeds the profile threshold are handed to an external validator — in
//! production an LLM judge — which confirms coherence, produces a
//! canonical statement, decides the derivation kind, and assigns
//! confidence. The shipped [`RuleValidator`] is the deterministic local
//! stand-in: pure term statistics, no model host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::search::overlap_score;

/// What an accepted cluster should become
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivationKind {
    /// A semantic fact
    Fact,
    /// A reusable workflow
    Procedure,
    /// Graph relations between co-occurring entities
    Relation,
}

/// Cluster digest handed to the validator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDigest {
    /// Content of the centroid member
    pub centroid_content: String,
    /// Contents of the exemplar members
    pub exemplars: Vec<String>,
    /// Union of member tags
    pub tags: Vec<String>,
    /// Cluster size
    pub size: usize,
    /// Member timestamps are strictly increasing
    pub monotone_timestamps: bool,
    /// Members mostly start with an action verb
    pub verb_prefixed: bool,
}

/// Validator verdict for one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    /// Whether the cluster is a coherent unit of knowledge
    pub coherent: bool,
    /// Canonical statement for the emitted fact
    pub statement: String,
    /// What to derive from the cluster
    pub derivation: DerivationKind,
    /// Confidence in [0,1] for the emitted fact
    pub confidence: f64,
}

/// External cluster validator (LLM judge in production)
#[async_trait]
pub trait Validator: Send + Sync {
    /// Judge one cluster digest
    async fn validate(&self, digest: &ClusterDigest) -> Result<Verdict>;
    /// Capability name for diagnostics
    fn name(&self) -> &str;
}

/// Deterministic stand-in validator
///
/// Coherence = mean pairwise term overlap between exemplars clears a
/// floor. The canonical statement is the centroid content; confidence
/// scales with overlap and cluster size.
pub struct RuleValidator {
    /// Minimum mean pairwise overlap to call a cluster coherent
    pub coherence_floor: f64,
}

impl Default for RuleValidator {
    fn default() -> Self {
        Self {
            coherence_floor: 0.2,
        }
    }
}

#[async_trait]
impl Validator for RuleValidator {
    async fn validate(&self, digest: &ClusterDigest) -> Result<Verdict> {
        let mut overlap_sum = 0.0;
        let mut pairs = 0usize;
        for (i, a) in digest.exemplars.iter().enumerate() {
            for b in digest.exemplars.iter().skip(i + 1) {
                overlap_sum += overlap_score(a, b).max(overlap_score(b, a));
                pairs += 1;
            }
        }
        let mean_overlap = if pairs == 0 {
            1.0 // single exemplar: nothing to disagree with
        } else {
            overlap_sum / pairs as f64
        };

        let coherent = mean_overlap >= self.coherence_floor;
        let derivation = if digest.monotone_timestamps && digest.verb_prefixed {
            DerivationKind::Procedure
        } else {
            DerivationKind::Fact
        };
        let size_weight = (digest.size as f64 / 10.0).min(0.3);
        let confidence = (0.4 + 0.3 * mean_overlap + size_weight).clamp(0.0, 1.0);

        Ok(Verdict {
            coherent,
            statement: digest.centroid_content.clone(),
            derivation,
            confidence,
        })
    }

    fn name(&self) -> &str {
        "rule-validator"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(exemplars: &[&str]) -> ClusterDigest {
        ClusterDigest {
            centroid_content: exemplars.first().unwrap_or(&"").to_string(),
            exemplars: exemplars.iter().map(|s| s.to_string()).collect(),
            tags: vec![],
            size: exemplars.len(),
            monotone_timestamps: false,
            verb_prefixed: false,
        }
    }

    #[tokio::test]
    async fn test_coherent_cluster_accepted() {
        let validator = RuleValidator::default();
        let verdict = validator
            .validate(&digest(&[
                "deploy service alpha to staging",
                "deploy service alpha to production",
                "deploy service alpha canary slice",
            ]))
            .await
            .unwrap();
        assert!(verdict.coherent);
        assert_eq!(verdict.derivation, DerivationKind::Fact);
        assert!(verdict.confidence > 0.5);
    }

    #[tokio::test]
    async fn test_incoherent_cluster_rejected() {
        let validator = RuleValidator::default();
        let verdict = validator
            .validate(&digest(&[
                "kernel upgrade finished",
                "birthday cake in the kitchen",
                "quarterly budget numbers",
            ]))
            .await
            .unwrap();
        assert!(!verdict.coherent);
    }

    #[tokio::test]
    async fn test_workflow_shape_becomes_procedure() {
        let validator = RuleValidator::default();
        let mut d = digest(&["run migrations", "run smoke tests", "run the deploy"]);
        d.monotone_timestamps = true;
        d.verb_prefixed = true;
        let verdict = validator.validate(&d).await.unwrap();
        assert_eq!(verdict.derivation, DerivationKind::Procedure);
    }
}
