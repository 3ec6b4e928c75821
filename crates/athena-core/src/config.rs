//! Engine Configuration
//!
//! Every tunable recognized by the memory core, with the documented
//! defaults. Construct with [`EngineConfig::default`] and override fields,
//! or deserialize from JSON (unknown fields are rejected).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the memory engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Tenant key; every row and every query is scoped to this project
    pub project: String,
    /// Size of the top-W working-memory projection
    pub working_memory_limit: usize,
    /// Weights for the working-memory compound score
    /// (importance, usefulness, recency)
    pub attention_weights: (f64, f64, f64),
    /// Embedding dimension; fixed per project at first write
    pub embedding_dim: usize,
    /// Default event importance when the caller supplies none
    pub importance_default: f64,
    /// Vector/lexical blend for hybrid search
    pub hybrid_alpha: f64,
    /// Recency boost weight in the hybrid score
    pub recency_beta: f64,
    /// Recency decay half-life
    #[serde(with = "duration_secs")]
    pub recency_halflife: Duration,
    /// Minimum event age before consolidation may touch it
    #[serde(with = "duration_secs")]
    pub min_event_age: Duration,
    /// Default consolidation profile name
    pub consolidation_profile: String,
    /// Cluster uncertainty above which System 2 validation runs
    pub uncertainty_threshold: f64,
    /// Minimum recall estimate for a run to be accepted
    pub recall_min: f64,
    /// Minimum consistency for a run to be accepted
    pub consistency_min: f64,
    /// Heartbeat age beyond which an in-progress task is preempted
    #[serde(with = "duration_secs")]
    pub stale_heartbeat: Duration,
    /// Maximum pending writes before `IngestBusy`
    pub ingest_soft_cap: usize,
    /// Scheduled consolidation interval
    #[serde(with = "duration_secs")]
    pub consolidation_interval: Duration,
    /// Queue a second consolidation request instead of rejecting it
    pub consolidation_queue: bool,
    /// Attention recompute / reaper tick interval
    #[serde(with = "duration_secs")]
    pub heartbeat_tick: Duration,
    /// Reader connections in the pool
    pub pool_readers: usize,
    /// Concurrent embedding calls
    pub embed_concurrency: usize,
    /// Per-call embedding timeout
    #[serde(with = "duration_secs")]
    pub embed_timeout: Duration,
    /// Deadline applied to every public engine operation
    #[serde(with = "duration_secs")]
    pub op_timeout: Duration,
    /// Bounded attempts for transient-error retries
    pub retry_attempts: u32,
    /// FILE trigger debounce window
    #[serde(with = "duration_secs")]
    pub file_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            working_memory_limit: 7,
            attention_weights: (0.5, 0.3, 0.2),
            embedding_dim: 256,
            importance_default: 0.5,
            hybrid_alpha: 0.7,
            recency_beta: 0.1,
            recency_halflife: Duration::from_secs(30 * 24 * 3600),
            min_event_age: Duration::from_secs(10 * 60),
            consolidation_profile: "balanced".to_string(),
            uncertainty_threshold: 0.5,
            recall_min: 0.75,
            consistency_min: 0.8,
            stale_heartbeat: Duration::from_secs(60),
            ingest_soft_cap: 1000,
            consolidation_interval: Duration::from_secs(3600),
            consolidation_queue: true,
            heartbeat_tick: Duration::from_secs(5),
            pool_readers: 4,
            embed_concurrency: 8,
            embed_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            file_debounce: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Config scoped to a named project, everything else at defaults.
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    /// Validate cross-field invariants before the engine starts.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.project.trim().is_empty() {
            return Err(crate::error::AthenaError::Invalid(
                "project scope must not be empty".to_string(),
            ));
        }
        if self.working_memory_limit == 0 {
            return Err(crate::error::AthenaError::Invalid(
                "working_memory_limit must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hybrid_alpha) {
            return Err(crate::error::AthenaError::Invalid(format!(
                "hybrid_alpha must be in [0,1], got {}",
                self.hybrid_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.recall_min) || !(0.0..=1.0).contains(&self.consistency_min) {
            return Err(crate::error::AthenaError::Invalid(
                "accept thresholds must be in [0,1]".to_string(),
            ));
        }
        if self.pool_readers == 0 || self.embed_concurrency == 0 {
            return Err(crate::error::AthenaError::Invalid(
                "pool sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serialize durations as whole seconds (fractional millis kept as f64)
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documentation() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.working_memory_limit, 7);
        assert_eq!(cfg.attention_weights, (0.5, 0.3, 0.2));
        assert!((cfg.hybrid_alpha - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.min_event_age, Duration::from_secs(600));
        assert_eq!(cfg.stale_heartbeat, Duration::from_secs(60));
        assert_eq!(cfg.ingest_soft_cap, 1000);
        assert_eq!(cfg.consolidation_profile, "balanced");
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let cfg = EngineConfig {
            hybrid_alpha: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_project() {
        let cfg = EngineConfig {
            project: "  ".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let cfg = EngineConfig::for_project("athena-tests");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project, "athena-tests");
        assert_eq!(back.recency_halflife, cfg.recency_halflife);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = r#"{"project": "p", "bogusKnob": 3}"#;
        let result: Result<EngineConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
