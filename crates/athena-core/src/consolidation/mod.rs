//! Consolidation Engine — Dual Process
//!
//! Converts episodic events into semantic facts, learned procedures, and
//! graph relations. System 1 is always-on statistics: window selection,
//! vectorization, density clustering, uncertainty scoring. System 2 runs
//! conditionally: clusters whose uncertainty clears the profile threshold
//! go to the injected validator, and validator failure demotes a cluster
//! to pending review instead of emitting it.
//!
//! Emission is all-or-nothing. Run metrics (compression, recall estimate,
//! consistency, density) are computed before anything is written; a run
//! below the accept thresholds writes no layer data at all and is
//! reported with `accepted = false`. At most one run per project executes
//! at a time, and cancellation at cluster boundaries is a clean outcome,
//! not an error.

mod clustering;
mod validator;

pub use clustering::{build_clusters, dbscan, tag_entropy, Cluster, ClusterParams};
pub use validator::{ClusterDigest, DerivationKind, RuleValidator, Validator, Verdict};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::embedding::{feature_hash, from_bytes};
use crate::episodic::{Event, EpisodicLayer};
use crate::error::{AthenaError, Result};
use crate::events::{EventBus, MemoryEvent};
use crate::graph::{GraphLayer, RelationDraft};
use crate::procedural::{ProceduralLayer, ProcedureDraft, ProcedureOrigin, ProcedureStep};
use crate::semantic::{FactDraft, SemanticLayer};
use crate::store::Store;
use crate::types::{normalize_tags, MemoryId};

/// Default window size when the caller gives none
const DEFAULT_WINDOW_EVENTS: usize = 1000;

/// Default window age span
const DEFAULT_WINDOW_AGE: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);

/// Verbs that mark a step-like event for procedure extraction
const ACTION_VERBS: &[&str] = &[
    "run", "deploy", "check", "verify", "restart", "update", "install", "configure", "build",
    "test", "create", "delete", "open", "close", "rotate", "apply", "merge", "commit", "push",
    "fetch", "scale", "execute", "migrate", "backup", "restore", "review", "triage",
];

/// Opposite-polarity marker pairs for the consistency check
const POLARITY_PAIRS: &[(&str, &str)] = &[
    ("success", "failure"),
    ("succeeded", "failed"),
    ("passed", "failed"),
    ("enabled", "disabled"),
    ("started", "stopped"),
    ("online", "offline"),
    ("deployed", "rolled back"),
    ("increase", "decrease"),
    ("healthy", "unhealthy"),
];

// ============================================================================
// PROFILES
// ============================================================================

/// Tunables of one consolidation profile
#[derive(Debug, Clone, Copy)]
pub struct ProfileParams {
    /// Clustering parameters
    pub cluster: ClusterParams,
    /// Whether System 2 validation runs at all
    pub system2: bool,
    /// Uncertainty above which System 2 is invoked
    pub theta_u: f64,
    /// Validator attempts per cluster
    pub validator_passes: u32,
    /// Whether accepted clusters are written out
    pub emit: bool,
}

impl ProfileParams {
    /// Resolve a named profile. `custom` must go through
    /// [`ConsolidationEngine::run_with`] with explicit parameters.
    pub fn named(name: &str, config: &EngineConfig) -> Result<Self> {
        match name {
            "speed" => Ok(Self {
                cluster: ClusterParams {
                    eps: 0.6,
                    min_samples: 2,
                    min_cluster_size: 5,
                },
                system2: false,
                theta_u: 1.0,
                validator_passes: 0,
                emit: true,
            }),
            "balanced" => Ok(Self {
                cluster: ClusterParams {
                    eps: 0.45,
                    min_samples: 2,
                    min_cluster_size: 3,
                },
                system2: true,
                theta_u: config.uncertainty_threshold,
                validator_passes: 1,
                emit: true,
            }),
            "quality" => Ok(Self {
                cluster: ClusterParams {
                    eps: 0.35,
                    min_samples: 2,
                    min_cluster_size: 3,
                },
                system2: true,
                theta_u: 0.3,
                validator_passes: 2,
                emit: true,
            }),
            "minimal" => Ok(Self {
                cluster: ClusterParams {
                    eps: 0.45,
                    min_samples: 2,
                    min_cluster_size: 3,
                },
                system2: false,
                theta_u: 1.0,
                validator_passes: 0,
                emit: false,
            }),
            other => Err(AthenaError::Invalid(format!(
                "unknown consolidation profile `{other}` (custom parameters go through run_with)"
            ))),
        }
    }
}

// ============================================================================
// REPORT
// ============================================================================

/// Quality metrics of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    /// facts_out / events_in
    pub compression_ratio: f64,
    /// Fraction of input events traceable from emitted facts
    pub recall_estimate: f64,
    /// Fraction of emitted facts free of pairwise contradictions
    pub consistency: f64,
    /// Average cluster size
    pub density: f64,
}

/// Outcome of one consolidation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    /// Run identifier
    pub run_id: String,
    /// Profile that ran
    pub profile: String,
    /// Events in the selected window
    pub events_in: usize,
    /// Clusters that survived size filtering
    pub clusters: usize,
    /// Facts written (zero when rejected or not emitting)
    pub facts_out: usize,
    /// Procedures written
    pub procedures_out: usize,
    /// Relations written
    pub relations_out: usize,
    /// Clusters demoted to pending review by validator failure
    pub pending_review: usize,
    /// Run metrics
    pub metrics: RunMetrics,
    /// Whether output was committed
    pub accepted: bool,
    /// Whether the run stopped at a cancellation point
    pub cancelled: bool,
    /// Run start time
    pub started_at: DateTime<Utc>,
    /// Run end time
    pub finished_at: DateTime<Utc>,
}

/// One recorded run, as read back from the audit table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Run identifier
    pub run_id: String,
    /// Profile name
    pub profile: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Metrics JSON as recorded
    pub metrics: RunMetrics,
    /// Whether output was committed
    pub accepted: bool,
}

/// What one cluster is about to become
struct EmissionPlan {
    statement: String,
    confidence: f64,
    topics: Vec<String>,
    member_ids: Vec<MemoryId>,
    derivation: DerivationKind,
    steps: Vec<String>,
    relations: Vec<(MemoryId, MemoryId, f64)>,
    earliest: DateTime<Utc>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The consolidation engine
#[derive(Clone)]
pub struct ConsolidationEngine {
    store: Store,
    episodic: EpisodicLayer,
    semantic: SemanticLayer,
    procedural: ProceduralLayer,
    graph: GraphLayer,
    validator: Arc<dyn Validator>,
    bus: EventBus,
    config: Arc<EngineConfig>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    cancel: Arc<AtomicBool>,
}

impl ConsolidationEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Store,
        episodic: EpisodicLayer,
        semantic: SemanticLayer,
        procedural: ProceduralLayer,
        graph: GraphLayer,
        validator: Arc<dyn Validator>,
        bus: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            episodic,
            semantic,
            procedural,
            graph,
            validator,
            bus,
            config,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cooperative cancellation of the current run. Checked at
    /// cluster boundaries; cancellation is a clean outcome.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Run with a named profile (`None` = the configured default).
    pub async fn run(
        &self,
        profile: Option<&str>,
        window: Option<usize>,
    ) -> Result<ConsolidationReport> {
        let name = profile
            .unwrap_or(self.config.consolidation_profile.as_str())
            .to_string();
        let params = ProfileParams::named(&name, &self.config)?;
        self.run_with(&name, params, window).await
    }

    /// Run with explicit parameters (the `custom` profile).
    pub async fn run_with(
        &self,
        profile_name: &str,
        params: ProfileParams,
        window: Option<usize>,
    ) -> Result<ConsolidationReport> {
        // One run per project: queue behind the lock, or bail out.
        let _guard = if self.config.consolidation_queue {
            self.run_lock.lock().await
        } else {
            self.run_lock
                .try_lock()
                .map_err(|_| AthenaError::ConsolidationBusy)?
        };
        self.cancel.store(false, Ordering::SeqCst);

        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let limit = window.unwrap_or(DEFAULT_WINDOW_EVENTS);

        // Snapshot the window; events recorded after this point are not
        // part of this run.
        let events = self
            .episodic
            .consolidation_window(self.config.min_event_age, DEFAULT_WINDOW_AGE, limit)
            .await?;

        if events.is_empty() {
            // Nothing eligible: an accepted no-op that writes nothing.
            return Ok(ConsolidationReport {
                run_id,
                profile: profile_name.to_string(),
                events_in: 0,
                clusters: 0,
                facts_out: 0,
                procedures_out: 0,
                relations_out: 0,
                pending_review: 0,
                metrics: RunMetrics {
                    consistency: 1.0,
                    ..Default::default()
                },
                accepted: true,
                cancelled: false,
                started_at,
                finished_at: Utc::now(),
            });
        }

        let vectors = self.vectorize(&events).await?;
        let labels = dbscan(&params.cluster, &vectors);
        let clusters = build_clusters(&params.cluster, &vectors, &labels);
        tracing::info!(
            "consolidation {run_id}: {} events, {} clusters ({profile_name})",
            events.len(),
            clusters.len()
        );

        // Known entities, for relation extraction.
        let entities = self.known_entities().await?;

        let mut plans: Vec<EmissionPlan> = Vec::new();
        let mut pending_review = 0usize;
        let mut cancelled = false;

        for cluster in &clusters {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            match self
                .plan_cluster(cluster, &events, &params, &entities)
                .await?
            {
                ClusterOutcome::Emit(plan) => plans.push(plan),
                ClusterOutcome::PendingReview => pending_review += 1,
                ClusterOutcome::Rejected => {}
            }
        }

        let cluster_count = clusters.len();
        let metrics = self.compute_metrics(&plans, events.len(), &clusters);

        if cancelled {
            tracing::info!("consolidation {run_id} cancelled at a cluster boundary");
            return Ok(ConsolidationReport {
                run_id,
                profile: profile_name.to_string(),
                events_in: events.len(),
                clusters: cluster_count,
                facts_out: 0,
                procedures_out: 0,
                relations_out: 0,
                pending_review,
                metrics,
                accepted: false,
                cancelled: true,
                started_at,
                finished_at: Utc::now(),
            });
        }

        let (facts_out, procedures_out, relations_out, accepted) = if !params.emit {
            (0, 0, 0, true) // metrics-only dry run
        } else {
            match self.commit(&run_id, &plans, &metrics).await {
                Ok(written) => (written.0, written.1, written.2, true),
                Err(AthenaError::ConsolidationRejected { recall, consistency }) => {
                    tracing::warn!(
                        "consolidation {run_id} rejected: recall={recall:.3} consistency={consistency:.3}"
                    );
                    (0, 0, 0, false)
                }
                Err(other) => return Err(other),
            }
        };

        let finished_at = Utc::now();
        self.record_run(&run_id, profile_name, started_at, finished_at, &metrics, accepted)
            .await?;
        self.bus.publish(MemoryEvent::ConsolidationFinished {
            run_id: run_id.clone(),
            accepted,
        });

        Ok(ConsolidationReport {
            run_id,
            profile: profile_name.to_string(),
            events_in: events.len(),
            clusters: cluster_count,
            facts_out,
            procedures_out,
            relations_out,
            pending_review,
            metrics,
            accepted,
            cancelled: false,
            started_at,
            finished_at,
        })
    }

    /// Past runs, newest first.
    pub async fn stats(&self) -> Result<Vec<RunRecord>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(
            "SELECT id, profile, started_at, finished_at, metrics, accepted
             FROM consolidation_runs WHERE project = ?1 ORDER BY started_at DESC",
        )?;
        let records = stmt
            .query_map(params![self.config.project], |row| {
                let metrics_json: String = row.get(4)?;
                Ok(RunRecord {
                    run_id: row.get(0)?,
                    profile: row.get(1)?,
                    started_at: row.get(2)?,
                    finished_at: row.get(3)?,
                    metrics: serde_json::from_str(&metrics_json).unwrap_or_default(),
                    accepted: row.get::<_, i64>(5)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ========================================================================
    // SYSTEM 1
    // ========================================================================

    /// Stored embedding per event, falling back to feature hashing so
    /// lexical-only projects still cluster.
    async fn vectorize(&self, events: &[Event]) -> Result<Vec<Vec<f32>>> {
        let reader = self.store.reader().await?;
        let mut vectors = Vec::with_capacity(events.len());
        for event in events {
            let blob: Option<Vec<u8>> = reader
                .query_row(
                    "SELECT embedding FROM events WHERE id = ?1",
                    params![event.id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            let vector = blob
                .and_then(|b| from_bytes(&b))
                .filter(|v| v.len() == self.config.embedding_dim)
                .unwrap_or_else(|| {
                    feature_hash(
                        &format!("{} {}", event.content, event.tags.join(" ")),
                        self.config.embedding_dim,
                    )
                });
            vectors.push(vector);
        }
        Ok(vectors)
    }

    async fn known_entities(&self) -> Result<Vec<(MemoryId, String)>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(
            "SELECT id, name FROM entities WHERE project = ?1 ORDER BY id",
        )?;
        let entities = stmt
            .query_map(params![self.config.project], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .map(|r| r.map(|(id, name)| (id, name.to_lowercase())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    // ========================================================================
    // SYSTEM 2 AND PLANNING
    // ========================================================================

    async fn plan_cluster(
        &self,
        cluster: &Cluster,
        events: &[Event],
        params: &ProfileParams,
        entities: &[(MemoryId, String)],
    ) -> Result<ClusterOutcome> {
        let members: Vec<&Event> = cluster.members.iter().map(|&i| &events[i]).collect();
        let mut by_time: Vec<&Event> = members.clone();
        by_time.sort_by_key(|e| (e.ts, e.id));

        let monotone = by_time.windows(2).all(|w| w[0].ts < w[1].ts);
        let verb_hits = by_time
            .iter()
            .filter(|e| {
                e.content
                    .split_whitespace()
                    .next()
                    .map(|w| ACTION_VERBS.contains(&w.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .count();
        let verb_prefixed = verb_hits * 10 >= by_time.len() * 6; // >= 60%

        let tags = normalize_tags(members.iter().flat_map(|e| e.tags.iter().cloned()));
        let digest = ClusterDigest {
            centroid_content: events[cluster.centroid_member].content.clone(),
            exemplars: cluster
                .exemplars
                .iter()
                .map(|&i| events[i].content.clone())
                .collect(),
            tags: tags.clone(),
            size: cluster.members.len(),
            monotone_timestamps: monotone,
            verb_prefixed,
        };

        // System 2 for uncertain clusters only.
        let verdict = if params.system2 && cluster.uncertainty > params.theta_u {
            let mut validated = None;
            for attempt in 0..params.validator_passes.max(1) {
                match self.validator.validate(&digest).await {
                    Ok(v) => {
                        validated = Some(v);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            "validator {} failed (attempt {}): {err}",
                            self.validator.name(),
                            attempt + 1
                        );
                    }
                }
            }
            match validated {
                Some(v) if v.coherent => v,
                Some(_) => return Ok(ClusterOutcome::Rejected),
                None => return Ok(ClusterOutcome::PendingReview),
            }
        } else {
            // System 1 verdict: the centroid speaks for the cluster, and
            // confidence falls with uncertainty.
            Verdict {
                coherent: true,
                statement: digest.centroid_content.clone(),
                derivation: if monotone && verb_prefixed {
                    DerivationKind::Procedure
                } else {
                    DerivationKind::Fact
                },
                confidence: (1.0 - cluster.uncertainty).clamp(0.3, 0.9),
            }
        };

        // Entities co-occurring in at least two member contents.
        let contents_lower: Vec<String> =
            members.iter().map(|e| e.content.to_lowercase()).collect();
        let present: Vec<MemoryId> = entities
            .iter()
            .filter(|(_, name)| {
                contents_lower.iter().filter(|c| c.contains(name.as_str())).count() >= 2
            })
            .map(|(id, _)| *id)
            .collect();
        let mut relations = Vec::new();
        for (i, &a) in present.iter().enumerate() {
            for &b in present.iter().skip(i + 1) {
                let strength =
                    (cluster.members.len() as f64 / (cluster.members.len() as f64 + 2.0)).min(1.0);
                relations.push((a, b, strength));
            }
        }

        Ok(ClusterOutcome::Emit(EmissionPlan {
            statement: verdict.statement,
            confidence: verdict.confidence,
            topics: tags,
            member_ids: by_time.iter().map(|e| e.id).collect(),
            derivation: verdict.derivation,
            steps: by_time.iter().map(|e| e.content.clone()).collect(),
            relations,
            earliest: by_time.first().map(|e| e.ts).unwrap_or_else(Utc::now),
        }))
    }

    // ========================================================================
    // METRICS AND EMISSION
    // ========================================================================

    fn compute_metrics(
        &self,
        plans: &[EmissionPlan],
        events_in: usize,
        clusters: &[Cluster],
    ) -> RunMetrics {
        let traceable: std::collections::HashSet<MemoryId> = plans
            .iter()
            .flat_map(|p| p.member_ids.iter().copied())
            .collect();
        let recall_estimate = if events_in == 0 {
            0.0
        } else {
            traceable.len() as f64 / events_in as f64
        };

        // Pairwise contradiction check over statements sharing a topic.
        let mut contradicted = vec![false; plans.len()];
        for i in 0..plans.len() {
            for j in (i + 1)..plans.len() {
                if !plans[i].topics.iter().any(|t| plans[j].topics.contains(t)) {
                    continue;
                }
                let a = plans[i].statement.to_lowercase();
                let b = plans[j].statement.to_lowercase();
                let conflict = POLARITY_PAIRS.iter().any(|(pos, neg)| {
                    (a.contains(pos) && b.contains(neg)) || (a.contains(neg) && b.contains(pos))
                });
                if conflict {
                    contradicted[i] = true;
                    contradicted[j] = true;
                }
            }
        }
        let consistency = if plans.is_empty() {
            1.0
        } else {
            contradicted.iter().filter(|c| !**c).count() as f64 / plans.len() as f64
        };

        let density = if clusters.is_empty() {
            0.0
        } else {
            clusters.iter().map(|c| c.members.len()).sum::<usize>() as f64 / clusters.len() as f64
        };

        RunMetrics {
            compression_ratio: if events_in == 0 {
                0.0
            } else {
                plans.len() as f64 / events_in as f64
            },
            recall_estimate,
            consistency,
            density,
        }
    }

    /// Write every plan in one transaction, or nothing. The accept
    /// thresholds are enforced here so a failing run rolls back before a
    /// single row lands.
    async fn commit(
        &self,
        run_id: &str,
        plans: &[EmissionPlan],
        metrics: &RunMetrics,
    ) -> Result<(usize, usize, usize)> {
        if metrics.recall_estimate < self.config.recall_min
            || metrics.consistency < self.config.consistency_min
        {
            return Err(AthenaError::ConsolidationRejected {
                recall: metrics.recall_estimate,
                consistency: metrics.consistency,
            });
        }

        let semantic = self.semantic.clone();
        let procedural = self.procedural.clone();
        let graph = self.graph.clone();
        let project = self.config.project.clone();
        let run_tag = run_id.to_string();

        struct Written {
            facts: usize,
            procedures: usize,
            relations: usize,
            embeddable: Vec<(MemoryId, String)>,
        }

        let written = self
            .store
            .transaction(move |tx| {
                let mut facts = 0;
                let mut procedures = 0;
                let mut relations = 0;
                let mut embeddable = Vec::new();

                for plan in plans {
                    let fact = semantic.insert_in_tx(
                        tx,
                        &FactDraft {
                            content: plan.statement.clone(),
                            topics: plan.topics.clone(),
                            confidence: Some(plan.confidence),
                            derived_from: plan.member_ids.clone(),
                        },
                    )?;
                    facts += 1;
                    embeddable.push((fact.id, plan.statement.clone()));

                    if plan.derivation == DerivationKind::Procedure {
                        let name = plan
                            .topics
                            .first()
                            .map(|t| format!("{t} workflow"))
                            .unwrap_or_else(|| {
                                let prefix: Vec<&str> =
                                    plan.statement.split_whitespace().take(3).collect();
                                format!("{} workflow", prefix.join(" "))
                            });
                        procedural.upsert_in_tx(
                            tx,
                            &ProcedureDraft {
                                name,
                                description: plan.statement.clone(),
                                steps: plan
                                    .steps
                                    .iter()
                                    .map(|s| ProcedureStep {
                                        action: s.clone(),
                                        expected: None,
                                    })
                                    .collect(),
                                category: Some("learned".to_string()),
                                created_by: Some(ProcedureOrigin::Learned),
                            },
                        )?;
                        procedures += 1;
                    }

                    for (src, dst, strength) in &plan.relations {
                        graph.upsert_relation_in_tx(
                            tx,
                            &RelationDraft {
                                src: *src,
                                dst: *dst,
                                relation_type: "co_occurs".to_string(),
                                strength: Some(*strength),
                                valid_from: Some(plan.earliest),
                                valid_until: None,
                                context: Some(format!("consolidation {run_tag}")),
                            },
                        )?;
                        relations += 1;
                    }

                    // Mark members consolidated so the next window skips them.
                    for event_id in &plan.member_ids {
                        tx.execute(
                            "UPDATE events SET consolidated = 1, updated_at = ?1
                             WHERE id = ?2 AND project = ?3",
                            params![Utc::now(), event_id, project],
                        )?;
                    }
                }

                Ok(Written {
                    facts,
                    procedures,
                    relations,
                    embeddable,
                })
            })
            .await?;

        // Best-effort: reuse member vectors is not possible for merged
        // statements, so hash-embed the new facts for the vector index.
        for (fact_id, statement) in &written.embeddable {
            let vector = feature_hash(statement, self.config.embedding_dim);
            if let Err(err) = self.semantic.set_embedding(*fact_id, &vector).await {
                tracing::warn!("fact {fact_id} embedding skipped: {err}");
            }
        }

        Ok((written.facts, written.procedures, written.relations))
    }

    async fn record_run(
        &self,
        run_id: &str,
        profile: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        metrics: &RunMetrics,
        accepted: bool,
    ) -> Result<()> {
        let writer = self.store.writer().await;
        writer.execute(
            "INSERT INTO consolidation_runs (id, project, started_at, finished_at, profile,
                                             metrics, accepted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                self.config.project,
                started_at,
                finished_at,
                profile,
                serde_json::to_string(metrics)?,
                accepted,
            ],
        )?;
        Ok(())
    }
}

enum ClusterOutcome {
    Emit(EmissionPlan),
    PendingReview,
    Rejected,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodic::EventDraft;

    fn make_engine(project: &str) -> (tempfile::TempDir, ConsolidationEngine, EpisodicLayer) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig {
            min_event_age: std::time::Duration::ZERO,
            ..EngineConfig::for_project(project)
        });
        let store = Store::open(Some(dir.path().join("athena.db")), &config).unwrap();
        let episodic = EpisodicLayer::new(store.clone(), config.clone());
        let semantic = SemanticLayer::new(store.clone(), config.clone());
        let procedural = ProceduralLayer::new(store.clone(), config.clone());
        let graph = GraphLayer::new(store.clone(), config.clone());
        let engine = ConsolidationEngine::new(
            store,
            episodic.clone(),
            semantic,
            procedural,
            graph,
            Arc::new(RuleValidator::default()),
            EventBus::new(),
            config,
        );
        (dir, engine, episodic)
    }

    async fn record(episodic: &EpisodicLayer, content: &str, tags: &[&str]) {
        let e = episodic.clone();
        let draft = EventDraft {
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        e.clone()
            .store()
            .transaction(move |tx| e.insert_in_tx(tx, &draft))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_eligible_events_is_accepted_noop() {
        let (_dir, engine, _) = make_engine("cons-empty");
        let report = engine.run(Some("balanced"), None).await.unwrap();
        assert_eq!(report.events_in, 0);
        assert_eq!(report.facts_out, 0);
        assert!(report.accepted);

        // Nothing recorded either: zero-event runs write nothing.
        assert!(engine.stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tight_clusters_emit_traceable_facts() {
        let (_dir, engine, episodic) = make_engine("cons-accept");
        for topic in ["deploy service alpha", "database backup routine"] {
            for i in 0..5 {
                record(
                    &episodic,
                    &format!("{topic} observation number {i}"),
                    &[topic.split_whitespace().next().unwrap()],
                )
                .await;
            }
        }

        let report = engine.run(Some("balanced"), None).await.unwrap();
        assert!(report.accepted);
        assert!(report.facts_out >= 2);
        assert!(report.metrics.recall_estimate >= 0.75);
        assert!(report.metrics.consistency >= 0.8);

        // Facts carry provenance.
        let reader = engine.store.reader().await.unwrap();
        let orphan_facts: i64 = reader
            .query_row(
                "SELECT COUNT(*) FROM facts f WHERE NOT EXISTS
                     (SELECT 1 FROM fact_sources s WHERE s.fact_id = f.id)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphan_facts, 0);

        // Members are marked so a second run finds nothing.
        let again = engine.run(Some("balanced"), None).await.unwrap();
        assert_eq!(again.events_in, 0);
    }

    #[tokio::test]
    async fn test_noise_run_is_rejected_with_no_writes() {
        let (_dir, engine, episodic) = make_engine("cons-reject");
        let noise = [
            "purple elephants quarterly",
            "socket wrench misplaced somewhere",
            "birthday cake thursday kitchen",
            "umbrella weather prediction model",
            "guitar string replacement order",
            "parking garage level four",
        ];
        for n in noise {
            record(&episodic, n, &[]).await;
        }

        let report = engine.run(Some("quality"), None).await.unwrap();
        assert!(!report.accepted);
        assert_eq!(report.facts_out, 0);
        assert!(report.metrics.recall_estimate < 0.75);

        let reader = engine.store.reader().await.unwrap();
        let facts: i64 = reader
            .query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(facts, 0);

        // The rejected run is still in the audit trail.
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert!(!stats[0].accepted);
    }

    #[tokio::test]
    async fn test_minimal_profile_writes_nothing() {
        let (_dir, engine, episodic) = make_engine("cons-minimal");
        for i in 0..4 {
            record(&episodic, &format!("deploy service alpha attempt {i}"), &["deploy"]).await;
        }
        let report = engine.run(Some("minimal"), None).await.unwrap();
        assert!(report.accepted);
        assert_eq!(report.facts_out, 0);
        assert!(report.clusters >= 1);

        let reader = engine.store.reader().await.unwrap();
        let facts: i64 = reader
            .query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(facts, 0);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_invalid() {
        let (_dir, engine, _) = make_engine("cons-profile");
        let err = engine.run(Some("turbo"), None).await.unwrap_err();
        assert!(matches!(err, AthenaError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_busy_when_queueing_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig {
            consolidation_queue: false,
            min_event_age: std::time::Duration::ZERO,
            ..EngineConfig::for_project("cons-busy")
        });
        let store = Store::open(Some(dir.path().join("athena.db")), &config).unwrap();
        let episodic = EpisodicLayer::new(store.clone(), config.clone());
        let engine = ConsolidationEngine::new(
            store,
            episodic.clone(),
            SemanticLayer::new(episodic.store().clone(), config.clone()),
            ProceduralLayer::new(episodic.store().clone(), config.clone()),
            GraphLayer::new(episodic.store().clone(), config.clone()),
            Arc::new(RuleValidator::default()),
            EventBus::new(),
            config,
        );

        let _held = engine.run_lock.lock().await;
        let err = engine.run(Some("balanced"), None).await.unwrap_err();
        assert!(matches!(err, AthenaError::ConsolidationBusy));
    }
}
