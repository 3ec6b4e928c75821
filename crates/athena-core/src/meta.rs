//! Meta Layer
//!
//! Memory about memory: per-memory usefulness from access feedback,
//! per-domain expertise, and the attention cache that projects the top-W
//! memories as working memory.
//!
//! Usefulness is Laplace-smoothed (`(useful + 1) / (accesses + 1)`) so a
//! single unlucky retrieval cannot zero a memory out, and repeated useful
//! hits converge to 1. The working-memory projection is a pure function of
//! current scores; readers get a copy-on-write snapshot and never block
//! the recompute.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{AthenaError, Result};
use crate::search::recency_boost;
use crate::store::Store;
use crate::types::MemoryRef;

/// Half-life of the working-memory recency component. Attention is a
/// short-horizon signal, unlike the retrieval recency boost.
const ATTENTION_RECENCY_HALFLIFE: Duration = Duration::from_secs(3600);

/// How many recent rows per layer feed the attention recompute.
const ATTENTION_CANDIDATES: i64 = 128;

// ============================================================================
// TYPES
// ============================================================================

/// Quality record for one memory in one layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQuality {
    /// The memory this record describes
    pub memory_ref: MemoryRef,
    /// Retrievals that touched it
    pub access_count: i64,
    /// Retrievals the caller marked useful
    pub useful_count: i64,
    /// Laplace-smoothed usefulness in (0,1]
    pub usefulness_score: f64,
    /// Layer-native confidence at last write
    pub confidence: f64,
    /// Last access time
    pub last_accessed: DateTime<Utc>,
}

/// Expertise ladder for a domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expertise {
    /// Fewer than 5 evidence items
    #[default]
    Beginner,
    /// 5 to 19
    Intermediate,
    /// 20 to 49
    Advanced,
    /// 50 or more
    Expert,
}

impl Expertise {
    /// Ladder position for an evidence count
    pub fn for_evidence(count: i64) -> Self {
        match count {
            c if c >= 50 => Expertise::Expert,
            c if c >= 20 => Expertise::Advanced,
            c if c >= 5 => Expertise::Intermediate,
            _ => Expertise::Beginner,
        }
    }

    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Expertise::Beginner => "beginner",
            Expertise::Intermediate => "intermediate",
            Expertise::Advanced => "advanced",
            Expertise::Expert => "expert",
        }
    }

    /// Parse the stored string form
    pub fn parse_name(s: &str) -> Self {
        match s {
            "expert" => Expertise::Expert,
            "advanced" => Expertise::Advanced,
            "intermediate" => Expertise::Intermediate,
            _ => Expertise::Beginner,
        }
    }
}

/// Domain coverage record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainCoverage {
    /// Domain label
    pub domain: String,
    /// Ladder position
    pub expertise: Expertise,
    /// Evidence items seen
    pub evidence_count: i64,
    /// Last evidence time
    pub last_update: DateTime<Utc>,
}

/// One entry of the working-memory projection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingItem {
    /// The projected memory
    pub memory_ref: MemoryRef,
    /// Compound attention score
    pub score: f64,
}

// ============================================================================
// LAYER
// ============================================================================

/// Meta layer over the durable store, plus the attention cache
#[derive(Clone)]
pub struct MetaLayer {
    store: Store,
    config: Arc<EngineConfig>,
    /// Copy-on-write working-memory snapshot
    attention: Arc<RwLock<Arc<Vec<WorkingItem>>>>,
}

impl MetaLayer {
    pub(crate) fn new(store: Store, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            config,
            attention: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }

    /// Record that a retrieval served this memory.
    pub async fn record_access(&self, memory_ref: MemoryRef) -> Result<()> {
        self.bump(memory_ref, false).await
    }

    /// Record caller feedback on a served memory. `useful = false` still
    /// counts the access, so the score can fall as well as rise.
    pub async fn mark_useful(&self, memory_ref: MemoryRef, useful: bool) -> Result<()> {
        self.bump(memory_ref, useful).await
    }

    async fn bump(&self, memory_ref: MemoryRef, useful: bool) -> Result<()> {
        let project = self.config.project.clone();
        self.store
            .transaction(move |tx| {
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO meta_quality
                         (project, layer, memory_ref, access_count, useful_count,
                          usefulness_score, confidence, last_accessed)
                     VALUES (?1, ?2, ?3, 0, 0, 0.5, 0.5, ?4)
                     ON CONFLICT (project, layer, memory_ref) DO NOTHING",
                    params![project, memory_ref.layer.as_str(), memory_ref.id, now],
                )?;
                tx.execute(
                    "UPDATE meta_quality SET
                         access_count = access_count + 1,
                         useful_count = useful_count + ?1,
                         usefulness_score =
                             CAST(useful_count + ?1 + 1 AS REAL) / CAST(access_count + 2 AS REAL),
                         last_accessed = ?2
                     WHERE project = ?3 AND layer = ?4 AND memory_ref = ?5",
                    params![
                        i64::from(useful),
                        now,
                        project,
                        memory_ref.layer.as_str(),
                        memory_ref.id
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetch the quality record for one memory.
    pub async fn quality(&self, memory_ref: MemoryRef) -> Result<Option<MemoryQuality>> {
        let reader = self.store.reader().await?;
        let quality = reader
            .query_row(
                "SELECT access_count, useful_count, usefulness_score, confidence, last_accessed
                 FROM meta_quality WHERE project = ?1 AND layer = ?2 AND memory_ref = ?3",
                params![
                    self.config.project,
                    memory_ref.layer.as_str(),
                    memory_ref.id
                ],
                |row| {
                    Ok(MemoryQuality {
                        memory_ref,
                        access_count: row.get(0)?,
                        useful_count: row.get(1)?,
                        usefulness_score: row.get(2)?,
                        confidence: row.get(3)?,
                        last_accessed: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(quality)
    }

    /// Count one evidence item toward a domain, moving the ladder.
    pub async fn record_domain_evidence(&self, domain: &str) -> Result<DomainCoverage> {
        if domain.trim().is_empty() {
            return Err(AthenaError::Invalid("domain must not be empty".to_string()));
        }
        let project = self.config.project.clone();
        let domain = domain.trim().to_lowercase();
        self.store
            .transaction(move |tx| {
                let now = Utc::now();
                let count: i64 = tx
                    .query_row(
                        "SELECT evidence_count FROM domain_coverage
                         WHERE project = ?1 AND domain = ?2",
                        params![project, domain],
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or(0)
                    + 1;
                let expertise = Expertise::for_evidence(count);
                tx.execute(
                    "INSERT INTO domain_coverage (project, domain, expertise, evidence_count,
                                                  last_update)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (project, domain) DO UPDATE SET
                         expertise = excluded.expertise,
                         evidence_count = excluded.evidence_count,
                         last_update = excluded.last_update",
                    params![project, domain, expertise.as_str(), count, now],
                )?;
                Ok(DomainCoverage {
                    domain: domain.clone(),
                    expertise,
                    evidence_count: count,
                    last_update: now,
                })
            })
            .await
    }

    /// All domain coverage records.
    pub async fn domain_coverage(&self) -> Result<Vec<DomainCoverage>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(
            "SELECT domain, expertise, evidence_count, last_update FROM domain_coverage
             WHERE project = ?1 ORDER BY domain",
        )?;
        let rows = stmt
            .query_map(params![self.config.project], |row| {
                let expertise: String = row.get(1)?;
                Ok(DomainCoverage {
                    domain: row.get(0)?,
                    expertise: Expertise::parse_name(&expertise),
                    evidence_count: row.get(2)?,
                    last_update: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // ATTENTION / WORKING MEMORY
    // ========================================================================

    /// Current working-memory snapshot (cheap Arc clone, never blocks the
    /// recompute).
    pub fn working_memory(&self) -> Arc<Vec<WorkingItem>> {
        self.attention
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    /// Working-set pressure in [0,1]: used slots over the limit.
    pub fn cognitive_load(&self) -> f64 {
        self.working_memory().len() as f64 / self.config.working_memory_limit as f64
    }

    /// Recompute the top-W projection from current scores. Called on
    /// insert and from the heartbeat tick. Returns the new load.
    pub async fn recompute_attention(&self) -> Result<f64> {
        let (w1, w2, w3) = self.config.attention_weights;
        let now = Utc::now();
        let mut scored: Vec<WorkingItem> = Vec::new();

        {
            let reader = self.store.reader().await?;
            let mut stmt = reader.prepare_cached(
                "SELECT e.id, e.importance, q.usefulness_score, e.ts
                 FROM events e
                 LEFT JOIN meta_quality q
                   ON q.project = e.project AND q.layer = 'episodic' AND q.memory_ref = e.id
                 WHERE e.project = ?1 AND e.tombstone = 0
                 ORDER BY e.ts DESC LIMIT ?2",
            )?;
            let events = stmt.query_map(
                params![self.config.project, ATTENTION_CANDIDATES],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )?;
            for row in events {
                let (id, importance, usefulness, ts) = row?;
                let recency = recency_boost(ts, now, ATTENTION_RECENCY_HALFLIFE);
                scored.push(WorkingItem {
                    memory_ref: MemoryRef::event(id),
                    score: w1 * importance + w2 * usefulness.unwrap_or(0.5) + w3 * recency,
                });
            }

            let mut stmt = reader.prepare_cached(
                "SELECT f.id, f.confidence, q.usefulness_score, f.last_accessed
                 FROM facts f
                 LEFT JOIN meta_quality q
                   ON q.project = f.project AND q.layer = 'semantic' AND q.memory_ref = f.id
                 WHERE f.project = ?1
                 ORDER BY f.last_accessed DESC LIMIT ?2",
            )?;
            let facts = stmt.query_map(
                params![self.config.project, ATTENTION_CANDIDATES],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )?;
            for row in facts {
                let (id, confidence, usefulness, last) = row?;
                let recency = recency_boost(last, now, ATTENTION_RECENCY_HALFLIFE);
                scored.push(WorkingItem {
                    memory_ref: MemoryRef::fact(id),
                    score: w1 * confidence + w2 * usefulness.unwrap_or(0.5) + w3 * recency,
                });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory_ref.id.cmp(&b.memory_ref.id))
        });
        scored.truncate(self.config.working_memory_limit);

        let snapshot = Arc::new(scored);
        if let Ok(mut guard) = self.attention.write() {
            *guard = Arc::clone(&snapshot);
        }
        Ok(snapshot.len() as f64 / self.config.working_memory_limit as f64)
    }
}

// ============================================================================
// TESTS
// ============================================================================
