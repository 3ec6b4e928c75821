//! Prospective Layer
//!
//! Future-directed memory: tasks, goals, and triggers. Tasks move through
//! a fixed state machine and are handed to agents through an atomic claim,
//! so a fleet of workers can share one queue without double execution.
//! Stale owners are preempted by a background reaper; replay is
//! at-least-once, so handlers are expected to be idempotent.
//!
//! ```text
//! pending → planning → ready → in_progress → completed
//!                   ↘ cancelled ↗           ↘ failed
//!   in_progress ↔ blocked
//! ```

mod triggers;

pub use triggers::{TriggerEvaluator, TriggerSpec};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{AthenaError, Result};
use crate::store::Store;
use crate::types::MemoryId;

// ============================================================================
// TASK STATE MACHINE
// ============================================================================

/// Task lifecycle states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies possibly outstanding
    #[default]
    Pending,
    /// Being decomposed or planned
    Planning,
    /// All dependencies met, claimable
    Ready,
    /// Owned by an agent
    InProgress,
    /// Owned but waiting on something external
    Blocked,
    /// Terminal: done
    Completed,
    /// Terminal: gave up
    Failed,
    /// Terminal: withdrawn
    Cancelled,
}

impl TaskStatus {
    /// Stable string form stored in the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stored string form
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "planning" => Some(TaskStatus::Planning),
            "ready" => Some(TaskStatus::Ready),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this state ends the lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The allowed edges of the state machine. Same-state transitions are
    /// handled by the caller as idempotent no-ops, not as edges.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Planning)
                | (Pending, Ready)
                | (Pending, Cancelled)
                | (Planning, Ready)
                | (Planning, Cancelled)
                | (Ready, InProgress)
                | (Ready, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (Blocked, InProgress)
                | (Blocked, Failed)
                | (Blocked, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// A unit of future work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Row id
    pub id: MemoryId,
    /// Tenant key
    pub project: String,
    /// Parent goal
    pub goal_id: Option<MemoryId>,
    /// Short title
    pub title: String,
    /// Full description
    pub description: String,
    /// Priority 1 (low) .. 10 (high)
    pub priority: i64,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Phase 1..7
    pub phase: i64,
    /// Tasks that must complete first
    pub depends_on: Vec<MemoryId>,
    /// Owning agent while in_progress or blocked
    pub owner_agent_id: Option<String>,
    /// Fencing token, bumped by every claim and preemption
    pub claim_version: i64,
    /// When the current owner claimed it
    pub claimed_at: Option<DateTime<Utc>>,
    /// Outcome payload once terminal
    pub result: Option<String>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskDraft {
    /// Short title
    pub title: String,
    /// Full description
    #[serde(default)]
    pub description: String,
    /// Priority 1..10; defaults to 5
    pub priority: Option<i64>,
    /// Tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<MemoryId>,
    /// Parent goal
    pub goal_id: Option<MemoryId>,
    /// Phase 1..7; defaults to 1
    pub phase: Option<i64>,
}

/// A goal aggregating tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    /// Row id
    pub id: MemoryId,
    /// Tenant key
    pub project: String,
    /// Short title
    pub title: String,
    /// Full description
    pub description: String,
    /// Priority 1..10
    pub priority: i64,
    /// Optional deadline
    pub deadline: Option<DateTime<Utc>>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update
    pub updated_at: DateTime<Utc>,
}

/// A persisted trigger row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// Row id
    pub id: MemoryId,
    /// What fires it
    pub spec: TriggerSpec,
    /// Task activated when it fires
    pub task_id: MemoryId,
    /// Disabled triggers are skipped by every clock
    pub enabled: bool,
    /// Last firing time
    pub last_fired: Option<DateTime<Utc>>,
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let depends_json: String = row.get("depends_on")?;
    Ok(Task {
        id: row.get("id")?,
        project: row.get("project")?,
        goal_id: row.get("goal_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        priority: row.get("priority")?,
        status: TaskStatus::parse_name(&status).unwrap_or_default(),
        phase: row.get("phase")?,
        depends_on: serde_json::from_str(&depends_json).unwrap_or_default(),
        owner_agent_id: row.get("owner_agent_id")?,
        claim_version: row.get("claim_version")?,
        claimed_at: row.get("claimed_at")?,
        result: row.get("result")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const TASK_COLUMNS: &str = "id, project, goal_id, title, description, priority, status, phase, \
                            depends_on, owner_agent_id, claim_version, claimed_at, result, \
                            created_at, updated_at";

// ============================================================================
// LAYER
// ============================================================================

/// Prospective layer over the durable store
#[derive(Clone)]
pub struct ProspectiveLayer {
    store: Store,
    config: std::sync::Arc<EngineConfig>,
}

impl ProspectiveLayer {
    pub(crate) fn new(store: Store, config: std::sync::Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Create a goal.
    pub async fn create_goal(
        &self,
        title: &str,
        description: &str,
        priority: i64,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Goal> {
        if title.trim().is_empty() {
            return Err(AthenaError::Invalid("goal title must not be empty".to_string()));
        }
        let project = self.config.project.clone();
        let title = title.to_string();
        let description = description.to_string();
        self.store
            .transaction(move |tx| {
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO goals (project, title, description, priority, deadline,
                                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![project, title, description, priority.clamp(1, 10), deadline, now],
                )?;
                let id = tx.last_insert_rowid();
                tx.query_row(
                    "SELECT id, project, title, description, priority, deadline, created_at,
                            updated_at
                     FROM goals WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Goal {
                            id: row.get(0)?,
                            project: row.get(1)?,
                            title: row.get(2)?,
                            description: row.get(3)?,
                            priority: row.get(4)?,
                            deadline: row.get(5)?,
                            created_at: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    },
                )
                .map_err(Into::into)
            })
            .await
    }

    /// Create a task inside an open transaction. Dependencies must exist;
    /// a task with none starts claimable.
    pub(crate) fn create_in_tx(&self, tx: &Transaction<'_>, draft: &TaskDraft) -> Result<Task> {
        if draft.title.trim().is_empty() {
            return Err(AthenaError::Invalid("task title must not be empty".to_string()));
        }
        let priority = draft.priority.unwrap_or(5);
        if !(1..=10).contains(&priority) {
            return Err(AthenaError::Invalid(format!(
                "priority must be in [1,10], got {priority}"
            )));
        }
        let phase = draft.phase.unwrap_or(1);
        if !(1..=7).contains(&phase) {
            return Err(AthenaError::Invalid(format!(
                "phase must be in [1,7], got {phase}"
            )));
        }
        for dep in &draft.depends_on {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE id = ?1 AND project = ?2",
                    params![dep, self.config.project],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(AthenaError::NotFound(format!("dependency task {dep}")));
            }
        }
        if let Some(goal_id) = draft.goal_id {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT id FROM goals WHERE id = ?1 AND project = ?2",
                    params![goal_id, self.config.project],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(AthenaError::NotFound(format!("goal {goal_id}")));
            }
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO tasks (project, goal_id, title, description, priority, status, phase,
                                depends_on, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8)",
            params![
                self.config.project,
                draft.goal_id,
                draft.title,
                draft.description,
                priority,
                phase,
                serde_json::to_string(&draft.depends_on)?,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        self.get_in_conn(tx, id)?
            .ok_or_else(|| AthenaError::NotFound(format!("task {id}")))
    }

    /// Fetch one task by id.
    pub async fn get(&self, id: MemoryId) -> Result<Option<Task>> {
        let reader = self.store.reader().await?;
        self.get_in_conn(&reader, id)
    }

    pub(crate) fn get_in_conn(&self, conn: &Connection, id: MemoryId) -> Result<Option<Task>> {
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND project = ?2"),
                params![id, self.config.project],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Tasks in a given state, priority then age order.
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE project = ?1 AND status = ?2
             ORDER BY priority DESC, id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![self.config.project, status.as_str()], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Drive a task through the state machine. Applying the same target
    /// state twice is a no-op; everything else must be an FSM edge.
    /// Completing a task promotes dependents whose dependencies are all
    /// complete and fires DEPENDENCY triggers in the same transaction.
    pub async fn update_status(
        &self,
        id: MemoryId,
        next: TaskStatus,
        result: Option<String>,
    ) -> Result<Task> {
        let this = self.clone();
        self.store
            .transaction(move |tx| this.update_status_in_tx(tx, id, next, result.as_deref()))
            .await
    }

    pub(crate) fn update_status_in_tx(
        &self,
        tx: &Transaction<'_>,
        id: MemoryId,
        next: TaskStatus,
        result: Option<&str>,
    ) -> Result<Task> {
        let task = self
            .get_in_conn(tx, id)?
            .ok_or_else(|| AthenaError::NotFound(format!("task {id}")))?;

        if task.status == next {
            return Ok(task); // idempotent
        }
        if task.status.is_terminal() {
            return Err(AthenaError::Invalid(format!(
                "task {id} is terminal ({})",
                task.status
            )));
        }
        if !task.status.can_transition_to(next) {
            return Err(AthenaError::Invalid(format!(
                "illegal transition {} -> {} for task {id}",
                task.status, next
            )));
        }
        if next == TaskStatus::Ready && !self.dependencies_met(tx, &task)? {
            return Err(AthenaError::Invalid(format!(
                "task {id} has incomplete dependencies"
            )));
        }

        let now = Utc::now();
        // Owner is non-null exactly while in_progress or blocked.
        let keep_owner = matches!(next, TaskStatus::InProgress | TaskStatus::Blocked);
        tx.execute(
            "UPDATE tasks SET status = ?1,
                    owner_agent_id = CASE WHEN ?2 THEN owner_agent_id ELSE NULL END,
                    claimed_at = CASE WHEN ?2 THEN claimed_at ELSE NULL END,
                    result = COALESCE(?3, result),
                    updated_at = ?4
             WHERE id = ?5 AND project = ?6",
            params![next.as_str(), keep_owner, result, now, id, self.config.project],
        )?;

        if next == TaskStatus::Completed {
            self.promote_dependents_in_tx(tx, id)?;
            TriggerEvaluator::fire_dependency_in_tx(self, tx, id)?;
        }

        self.get_in_conn(tx, id)?
            .ok_or_else(|| AthenaError::NotFound(format!("task {id}")))
    }

    fn dependencies_met(&self, conn: &Connection, task: &Task) -> Result<bool> {
        for dep in &task.depends_on {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM tasks WHERE id = ?1 AND project = ?2",
                    params![dep, self.config.project],
                    |row| row.get(0),
                )
                .optional()?;
            if status.as_deref() != Some("completed") {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Promote pending/planning dependents of a completed task whose
    /// dependencies are now all complete.
    fn promote_dependents_in_tx(&self, tx: &Transaction<'_>, completed: MemoryId) -> Result<()> {
        let mut stmt = tx.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE project = ?1 AND status IN ('pending', 'planning')"
        ))?;
        let candidates: Vec<Task> = stmt
            .query_map(params![self.config.project], task_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        for task in candidates {
            if !task.depends_on.contains(&completed) {
                continue;
            }
            if self.dependencies_met(tx, &task)? {
                tx.execute(
                    "UPDATE tasks SET status = 'ready', updated_at = ?1
                     WHERE id = ?2 AND project = ?3",
                    params![Utc::now(), task.id, self.config.project],
                )?;
            }
        }
        Ok(())
    }

    /// Atomically claim a task for an agent. Exactly one concurrent caller
    /// wins; the rest get `AlreadyClaimed`. Also refreshes the agent's
    /// heartbeat so a claim is itself proof of life.
    pub async fn claim(&self, id: MemoryId, agent_id: &str) -> Result<Task> {
        if agent_id.trim().is_empty() {
            return Err(AthenaError::Invalid("agent id must not be empty".to_string()));
        }
        let this = self.clone();
        let agent = agent_id.to_string();
        self.store
            .transaction(move |tx| {
                let task = this
                    .get_in_conn(tx, id)?
                    .ok_or_else(|| AthenaError::NotFound(format!("task {id}")))?;

                let claimable_from_pending =
                    task.status == TaskStatus::Pending && task.depends_on.is_empty();
                let now = Utc::now();
                let changed = tx.execute(
                    "UPDATE tasks SET status = 'in_progress', owner_agent_id = ?1,
                            claimed_at = ?2, claim_version = claim_version + 1, updated_at = ?2
                     WHERE id = ?3 AND project = ?4 AND owner_agent_id IS NULL
                       AND claim_version = ?5
                       AND (status = 'ready' OR (status = 'pending' AND ?6))",
                    params![
                        agent,
                        now,
                        id,
                        this.config.project,
                        task.claim_version,
                        claimable_from_pending,
                    ],
                )?;
                if changed == 0 {
                    return Err(AthenaError::AlreadyClaimed(id));
                }
                this.touch_heartbeat_in_tx(tx, &agent, now)?;
                this.get_in_conn(tx, id)?
                    .ok_or_else(|| AthenaError::NotFound(format!("task {id}")))
            })
            .await
    }

    /// Record that an agent is alive.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let this = self.clone();
        let agent = agent_id.to_string();
        self.store
            .transaction(move |tx| this.touch_heartbeat_in_tx(tx, &agent, Utc::now()))
            .await
    }

    fn touch_heartbeat_in_tx(
        &self,
        tx: &Transaction<'_>,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO agent_heartbeats (project, agent_id, last_seen) VALUES (?1, ?2, ?3)
             ON CONFLICT (project, agent_id) DO UPDATE SET last_seen = excluded.last_seen",
            params![self.config.project, agent_id, now],
        )?;
        Ok(())
    }

    /// Reset in-progress tasks whose owner's heartbeat lapsed: status back
    /// to ready, owner cleared, fencing token bumped, and a `preempted`
    /// meta event recorded — all in one transaction per sweep.
    pub async fn reap_stale(&self) -> Result<Vec<MemoryId>> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(self.config.stale_heartbeat).unwrap_or_default();
        let this = self.clone();
        self.store
            .transaction(move |tx| {
                let mut stmt = tx.prepare_cached(
                    "SELECT t.id, t.owner_agent_id FROM tasks t
                     LEFT JOIN agent_heartbeats h
                       ON h.project = t.project AND h.agent_id = t.owner_agent_id
                     WHERE t.project = ?1 AND t.status = 'in_progress'
                       AND (h.last_seen IS NULL OR h.last_seen < ?2)",
                )?;
                let stale: Vec<(MemoryId, Option<String>)> = stmt
                    .query_map(params![this.config.project, threshold], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<std::result::Result<_, _>>()?;
                drop(stmt);

                let now = Utc::now();
                let mut preempted = Vec::new();
                for (id, owner) in stale {
                    tx.execute(
                        "UPDATE tasks SET status = 'ready', owner_agent_id = NULL,
                                claimed_at = NULL, claim_version = claim_version + 1,
                                updated_at = ?1
                         WHERE id = ?2 AND project = ?3",
                        params![now, id, this.config.project],
                    )?;
                    tx.execute(
                        "INSERT INTO meta_events (project, kind, layer, memory_ref, detail,
                                                  created_at)
                         VALUES (?1, 'preempted', 'prospective', ?2, ?3, ?4)",
                        params![
                            this.config.project,
                            id,
                            owner.unwrap_or_else(|| "unknown".to_string()),
                            now
                        ],
                    )?;
                    preempted.push(id);
                }
                Ok(preempted)
            })
            .await
    }

    // ========================================================================
    // TRIGGERS
    // ========================================================================

    /// Register a trigger that activates `task_id` when it fires.
    pub async fn create_trigger(&self, spec: TriggerSpec, task_id: MemoryId) -> Result<Trigger> {
        spec.validate()?;
        let this = self.clone();
        self.store
            .transaction(move |tx| {
                let task: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM tasks WHERE id = ?1 AND project = ?2",
                        params![task_id, this.config.project],
                        |row| row.get(0),
                    )
                    .optional()?;
                if task.is_none() {
                    return Err(AthenaError::NotFound(format!("task {task_id}")));
                }
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO triggers (project, kind, spec, task_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        this.config.project,
                        spec.kind(),
                        serde_json::to_string(&spec)?,
                        task_id,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                Ok(Trigger {
                    id,
                    spec,
                    task_id,
                    enabled: true,
                    last_fired: None,
                })
            })
            .await
    }

    /// Enabled triggers of one kind.
    pub(crate) fn triggers_of_kind_in_conn(
        &self,
        conn: &Connection,
        kind: &str,
    ) -> Result<Vec<Trigger>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, spec, task_id, enabled, last_fired FROM triggers
             WHERE project = ?1 AND kind = ?2 AND enabled = 1 ORDER BY id",
        )?;
        let rows: Vec<(i64, String, i64, i64, Option<DateTime<Utc>>)> = stmt
            .query_map(params![self.config.project, kind], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;
        let mut triggers = Vec::with_capacity(rows.len());
        for (id, spec_json, task_id, enabled, last_fired) in rows {
            match serde_json::from_str::<TriggerSpec>(&spec_json) {
                Ok(spec) => triggers.push(Trigger {
                    id,
                    spec,
                    task_id,
                    enabled: enabled != 0,
                    last_fired,
                }),
                Err(err) => {
                    tracing::warn!("trigger {id} has unreadable spec, skipping: {err}");
                }
            }
        }
        Ok(triggers)
    }

    /// Fire one trigger: activate its task (pending/planning → ready) in
    /// the caller's transaction. A trigger whose task no longer exists is
    /// silently disabled.
    pub(crate) fn fire_in_tx(&self, tx: &Transaction<'_>, trigger: &Trigger) -> Result<bool> {
        let task = self.get_in_conn(tx, trigger.task_id)?;
        let now = Utc::now();
        let Some(task) = task else {
            tx.execute(
                "UPDATE triggers SET enabled = 0, updated_at = ?1 WHERE id = ?2",
                params![now, trigger.id],
            )?;
            tracing::warn!(
                "trigger {} disabled: task {} no longer exists",
                trigger.id,
                trigger.task_id
            );
            return Ok(false);
        };

        let fired = match task.status {
            TaskStatus::Pending | TaskStatus::Planning => {
                if self.dependencies_met(tx, &task)? {
                    tx.execute(
                        "UPDATE tasks SET status = 'ready', updated_at = ?1
                         WHERE id = ?2 AND project = ?3",
                        params![now, task.id, self.config.project],
                    )?;
                    true
                } else {
                    false
                }
            }
            // Already active or terminal: firing is a no-op.
            _ => false,
        };

        tx.execute(
            "UPDATE triggers SET last_fired = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, trigger.id],
        )?;
        Ok(fired)
    }
}

// ============================================================================
// TESTS
// ============================================================================
