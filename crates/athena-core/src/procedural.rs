//! Procedural Layer
//!
//! Reusable named workflows. Each procedure carries an ordered step list
//! and a success rate maintained as a running mean over every recorded
//! outcome:
//!
//! `new_rate = (old_rate * usage_count + outcome) / (usage_count + 1)`
//!
//! which keeps the rate in [0,1] and the count monotone. Search is lexical
//! over name and description, with ties broken by success rate and then
//! recency of use.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{AthenaError, Result};
use crate::search::overlap_score;
use crate::store::Store;
use crate::types::MemoryId;

// ============================================================================
// TYPES
// ============================================================================

/// Who created a procedure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureOrigin {
    /// Registered explicitly by a user or agent
    #[default]
    User,
    /// Extracted by the consolidation engine
    Learned,
    /// Imported from an external catalog
    Imported,
}

impl ProcedureOrigin {
    /// Stable string form stored in the `created_by` column
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureOrigin::User => "user",
            ProcedureOrigin::Learned => "learned",
            ProcedureOrigin::Imported => "imported",
        }
    }

    /// Parse the stored string form
    pub fn parse_name(s: &str) -> Self {
        match s {
            "learned" => ProcedureOrigin::Learned,
            "imported" => ProcedureOrigin::Imported,
            _ => ProcedureOrigin::User,
        }
    }
}

/// One step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureStep {
    /// What to do
    pub action: String,
    /// Expected outcome, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

/// A reusable named workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    /// Row id
    pub id: MemoryId,
    /// Tenant key
    pub project: String,
    /// Unique name within the project
    pub name: String,
    /// What the workflow accomplishes
    pub description: String,
    /// Ordered steps
    pub steps: Vec<ProcedureStep>,
    /// Category label
    pub category: String,
    /// Running-mean success rate in [0,1]
    pub success_rate: f64,
    /// Number of recorded outcomes
    pub usage_count: i64,
    /// Last execution time
    pub last_used: Option<DateTime<Utc>>,
    /// Who created it
    pub created_by: ProcedureOrigin,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProcedureDraft {
    /// Unique name within the project
    pub name: String,
    /// What the workflow accomplishes
    #[serde(default)]
    pub description: String,
    /// Ordered steps
    #[serde(default)]
    pub steps: Vec<ProcedureStep>,
    /// Category label; defaults to `general`
    pub category: Option<String>,
    /// Who created it; defaults to `user`
    pub created_by: Option<ProcedureOrigin>,
}

/// Aggregate statistics over the procedural layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureStats {
    /// Total procedures
    pub total: i64,
    /// Total recorded outcomes
    pub total_outcomes: i64,
    /// Mean success rate over procedures with at least one outcome
    pub mean_success_rate: f64,
    /// Procedures the consolidation engine learned
    pub learned: i64,
}

fn procedure_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Procedure> {
    let steps_json: String = row.get("steps")?;
    let created_by: String = row.get("created_by")?;
    Ok(Procedure {
        id: row.get("id")?,
        project: row.get("project")?,
        name: row.get("name")?,
        description: row.get("description")?,
        steps: serde_json::from_str(&steps_json).unwrap_or_default(),
        category: row.get("category")?,
        success_rate: row.get("success_rate")?,
        usage_count: row.get("usage_count")?,
        last_used: row.get("last_used")?,
        created_by: ProcedureOrigin::parse_name(&created_by),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const PROC_COLUMNS: &str = "id, project, name, description, steps, category, success_rate, \
                            usage_count, last_used, created_by, created_at, updated_at";

// ============================================================================
// LAYER
// ============================================================================

/// Procedural layer over the durable store
#[derive(Clone)]
pub struct ProceduralLayer {
    store: Store,
    config: std::sync::Arc<EngineConfig>,
}

impl ProceduralLayer {
    pub(crate) fn new(store: Store, config: std::sync::Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Insert or update a procedure by (project, name). Updates replace
    /// description, steps, and category but never reset the outcome
    /// counters.
    pub(crate) fn upsert_in_tx(&self, tx: &Transaction<'_>, draft: &ProcedureDraft) -> Result<Procedure> {
        if draft.name.trim().is_empty() {
            return Err(AthenaError::Invalid("procedure name must not be empty".to_string()));
        }
        let now = Utc::now();
        let steps_json = serde_json::to_string(&draft.steps)?;
        let category = draft.category.clone().unwrap_or_else(|| "general".to_string());
        let created_by = draft.created_by.unwrap_or_default();

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM procedures WHERE project = ?1 AND name = ?2",
                params![self.config.project, draft.name],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE procedures SET description = ?1, steps = ?2, category = ?3,
                            updated_at = ?4
                     WHERE id = ?5",
                    params![draft.description, steps_json, category, now, id],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO procedures (project, name, description, steps, category,
                                             created_by, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        self.config.project,
                        draft.name,
                        draft.description,
                        steps_json,
                        category,
                        created_by.as_str(),
                        now,
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        self.get_in_conn(tx, id)?
            .ok_or_else(|| AthenaError::NotFound(format!("procedure {id}")))
    }

    /// Fetch one procedure by id.
    pub async fn get(&self, id: MemoryId) -> Result<Option<Procedure>> {
        let reader = self.store.reader().await?;
        self.get_in_conn(&reader, id)
    }

    pub(crate) fn get_in_conn(&self, conn: &Connection, id: MemoryId) -> Result<Option<Procedure>> {
        let procedure = conn
            .query_row(
                &format!("SELECT {PROC_COLUMNS} FROM procedures WHERE id = ?1 AND project = ?2"),
                params![id, self.config.project],
                procedure_from_row,
            )
            .optional()?;
        Ok(procedure)
    }

    /// Fetch one procedure by name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Procedure>> {
        let reader = self.store.reader().await?;
        let procedure = reader
            .query_row(
                &format!("SELECT {PROC_COLUMNS} FROM procedures WHERE project = ?1 AND name = ?2"),
                params![self.config.project, name],
                procedure_from_row,
            )
            .optional()?;
        Ok(procedure)
    }

    /// All procedures, stable order.
    pub async fn list(&self) -> Result<Vec<Procedure>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(&format!(
            "SELECT {PROC_COLUMNS} FROM procedures WHERE project = ?1 ORDER BY name ASC"
        ))?;
        let procedures = stmt
            .query_map(params![self.config.project], procedure_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(procedures)
    }

    /// Lexical search over name and description. Ties break by success
    /// rate, then by most recent use.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<(Procedure, f64)>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let all = self.list().await?;
        let mut scored: Vec<(Procedure, f64)> = all
            .into_iter()
            .filter_map(|p| {
                let text = format!("{} {}", p.name, p.description);
                let score = overlap_score(query, &text);
                (score > 0.0).then_some((p, score))
            })
            .collect();
        scored.sort_by(|(pa, sa), (pb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    pb.success_rate
                        .partial_cmp(&pa.success_rate)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| pb.last_used.cmp(&pa.last_used))
                .then_with(|| pa.id.cmp(&pb.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Record one execution outcome, updating the running mean.
    pub async fn record_outcome(&self, id: MemoryId, success: bool) -> Result<Procedure> {
        let project = self.config.project.clone();
        let this = self.clone();
        self.store
            .transaction(move |tx| {
                let current = this
                    .get_in_conn(tx, id)?
                    .ok_or_else(|| AthenaError::NotFound(format!("procedure {id}")))?;
                let outcome = if success { 1.0 } else { 0.0 };
                let count = current.usage_count as f64;
                let new_rate = (current.success_rate * count + outcome) / (count + 1.0);
                let now = Utc::now();
                tx.execute(
                    "UPDATE procedures SET success_rate = ?1, usage_count = usage_count + 1,
                            last_used = ?2, updated_at = ?2
                     WHERE id = ?3 AND project = ?4",
                    params![new_rate.clamp(0.0, 1.0), now, id, project],
                )?;
                this.get_in_conn(tx, id)?
                    .ok_or_else(|| AthenaError::NotFound(format!("procedure {id}")))
            })
            .await
    }

    /// Aggregate statistics.
    pub async fn statistics(&self) -> Result<ProcedureStats> {
        let reader = self.store.reader().await?;
        let stats = reader.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(usage_count), 0),
                    COALESCE(AVG(CASE WHEN usage_count > 0 THEN success_rate END), 0.0),
                    COALESCE(SUM(CASE WHEN created_by = 'learned' THEN 1 ELSE 0 END), 0)
             FROM procedures WHERE project = ?1",
            params![self.config.project],
            |row| {
                Ok(ProcedureStats {
                    total: row.get(0)?,
                    total_outcomes: row.get(1)?,
                    mean_success_rate: row.get(2)?,
                    learned: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }
}

// ============================================================================
// TESTS
// ============================================================================
