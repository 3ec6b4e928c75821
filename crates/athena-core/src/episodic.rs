//! Episodic Layer
//!
//! Append-only timestamped experiences. Events are never edited after
//! write; corrections are new events carrying a `corrects` tag that names
//! the corrected event, and deletion is a tombstone that cascades into
//! `fact_sources` links rather than removing rows. A session is the
//! ordered run of events sharing a `session_id`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{AthenaError, Result};
use crate::search::{self, Candidate, HybridWeights};
use crate::store::Store;
use crate::types::{normalize_tags, Layer, MemoryId};

// ============================================================================
// TYPES
// ============================================================================

/// A single timestamped experience
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Row id
    pub id: MemoryId,
    /// Tenant key
    pub project: String,
    /// Session this event belongs to
    pub session_id: Option<String>,
    /// Event time
    pub ts: DateTime<Utc>,
    /// What happened
    pub content: String,
    /// Normalized tag set
    pub tags: Vec<String>,
    /// Caller-supplied importance in [0,1]
    pub importance: f64,
    /// Originating agent or system
    pub source: Option<String>,
    /// Whether an embedding is stored
    pub has_embedding: bool,
    /// Recorded without an embedding because the service was down
    pub degraded: bool,
    /// Already folded into a consolidation run
    pub consolidated: bool,
    /// Soft-deleted
    pub tombstone: bool,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update (soft delete, consolidation mark)
    pub updated_at: DateTime<Utc>,
}

/// Input for recording a new event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventDraft {
    /// What happened
    pub content: String,
    /// Tags; normalized on write
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance in [0,1]; defaults from config when absent
    pub importance: Option<f64>,
    /// Session key
    pub session_id: Option<String>,
    /// Originating agent or system
    pub source: Option<String>,
}

/// Filters for episodic recall
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilter {
    /// All listed tags must be present
    pub tags: Vec<String>,
    /// Restrict to one session
    pub session_id: Option<String>,
    /// Events at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Events strictly before this time
    pub until: Option<DateTime<Utc>>,
    /// Minimum importance
    pub min_importance: Option<f64>,
}

pub(crate) fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get("tags")?;
    Ok(Event {
        id: row.get("id")?,
        project: row.get("project")?,
        session_id: row.get("session_id")?,
        ts: row.get("ts")?,
        content: row.get("content")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        importance: row.get("importance")?,
        source: row.get("source")?,
        has_embedding: row.get::<_, Option<Vec<u8>>>("embedding")?.is_some(),
        degraded: row.get::<_, i64>("degraded")? != 0,
        consolidated: row.get::<_, i64>("consolidated")? != 0,
        tombstone: row.get::<_, i64>("tombstone")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const EVENT_COLUMNS: &str = "id, project, session_id, ts, content, tags, importance, source, \
                             embedding, degraded, consolidated, tombstone, created_at, updated_at";

// ============================================================================
// LAYER
// ============================================================================

/// Episodic layer over the durable store
#[derive(Clone)]
pub struct EpisodicLayer {
    store: Store,
    config: std::sync::Arc<EngineConfig>,
}

impl EpisodicLayer {
    pub(crate) fn new(store: Store, config: std::sync::Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Insert an event inside an open transaction: row, tag edges, meta
    /// back-reference. Embedding happens after commit, best effort.
    pub(crate) fn insert_in_tx(&self, tx: &Transaction<'_>, draft: &EventDraft) -> Result<Event> {
        if draft.content.trim().is_empty() {
            return Err(AthenaError::Invalid("event content must not be empty".to_string()));
        }
        let importance = draft.importance.unwrap_or(self.config.importance_default);
        if !(0.0..=1.0).contains(&importance) {
            return Err(AthenaError::Invalid(format!(
                "importance must be in [0,1], got {importance}"
            )));
        }

        let now = Utc::now();
        let tags = normalize_tags(&draft.tags);
        let tags_json = serde_json::to_string(&tags)?;

        tx.execute(
            "INSERT INTO events (project, session_id, ts, content, tags, importance, source,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                self.config.project,
                draft.session_id,
                now,
                draft.content,
                tags_json,
                importance,
                draft.source,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt =
                tx.prepare_cached("INSERT OR IGNORE INTO event_tags (event_id, tag) VALUES (?1, ?2)")?;
            for tag in &tags {
                stmt.execute(params![id, tag])?;
            }
        }

        // Meta back-reference in the same transaction: the write and its
        // quality row become visible together.
        tx.execute(
            "INSERT OR IGNORE INTO meta_quality
                 (project, layer, memory_ref, access_count, useful_count, usefulness_score,
                  confidence, last_accessed)
             VALUES (?1, 'episodic', ?2, 0, 0, 0.5, ?3, ?4)",
            params![self.config.project, id, importance, now],
        )?;

        self.get_in_conn(tx, id)?
            .ok_or_else(|| AthenaError::NotFound(format!("event {id}")))
    }

    /// Store the embedding for an event and update the vector index.
    pub(crate) async fn set_embedding(&self, id: MemoryId, vector: &[f32]) -> Result<()> {
        let blob = crate::embedding::to_bytes(vector);
        {
            let writer = self.store.writer().await;
            writer.execute(
                "UPDATE events SET embedding = ?1, degraded = 0, updated_at = ?2
                 WHERE id = ?3 AND project = ?4",
                params![blob, Utc::now(), id, self.config.project],
            )?;
        }
        self.store.index_embedding(Layer::Episodic, id, vector);
        Ok(())
    }

    /// Flag an event as recorded without an embedding.
    pub(crate) async fn mark_degraded(&self, id: MemoryId) -> Result<()> {
        let writer = self.store.writer().await;
        writer.execute(
            "UPDATE events SET degraded = 1, updated_at = ?1 WHERE id = ?2 AND project = ?3",
            params![Utc::now(), id, self.config.project],
        )?;
        Ok(())
    }

    /// Fetch one event by id.
    pub async fn get(&self, id: MemoryId) -> Result<Option<Event>> {
        let reader = self.store.reader().await?;
        self.get_in_conn(&reader, id)
    }

    pub(crate) fn get_in_conn(&self, conn: &Connection, id: MemoryId) -> Result<Option<Event>> {
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1 AND project = ?2"),
                params![id, self.config.project],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Hybrid recall: FTS5 + vector candidates blended deterministically.
    ///
    /// `query_vec` is the already-embedded query; `None` means lexical-only
    /// (degraded mode or no embedder).
    pub async fn recall(
        &self,
        query: &str,
        query_vec: Option<&[f32]>,
        filter: &EventFilter,
        k: usize,
    ) -> Result<Vec<(Event, f64)>> {
        if k == 0 || (query.trim().is_empty() && query_vec.is_none()) {
            return Ok(Vec::new());
        }
        let fetch = k.saturating_mul(3).max(k);

        let mut lex_hits: Vec<(MemoryId, f64)> = Vec::new();
        {
            let reader = self.store.reader().await?;
            let match_expr = search::sanitize_fts5_query(query);
            if !match_expr.is_empty() {
                let mut stmt = reader.prepare_cached(
                    "SELECT e.id, bm25(events_fts) AS rank
                     FROM events_fts JOIN events e ON e.id = events_fts.rowid
                     WHERE events_fts MATCH ?1 AND e.project = ?2 AND e.tombstone = 0
                     ORDER BY rank LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![match_expr, self.config.project, fetch as i64],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
                )?;
                for row in rows {
                    let (id, bm25) = row?;
                    lex_hits.push((id, search::bm25_to_score(bm25)));
                }
            }
        }

        let vec_hits: Vec<(MemoryId, f32)> = match query_vec {
            Some(qv) => self.store.vector_search(Layer::Episodic, qv, fetch, |_| true),
            None => Vec::new(),
        };

        let mut ids: Vec<MemoryId> = lex_hits.iter().map(|(id, _)| *id).collect();
        ids.extend(vec_hits.iter().map(|(id, _)| *id));
        ids.sort_unstable();
        ids.dedup();

        let mut candidates = Vec::new();
        let mut events = std::collections::HashMap::new();
        {
            let reader = self.store.reader().await?;
            for id in &ids {
                if let Some(event) = self.get_in_conn(&reader, *id)? {
                    if event.tombstone || !filter_matches(&event, filter) {
                        continue;
                    }
                    let lex = lex_hits.iter().find(|(i, _)| i == id).map(|(_, s)| *s);
                    let vec = vec_hits
                        .iter()
                        .find(|(i, _)| i == id)
                        .map(|(_, s)| f64::from(*s));
                    candidates.push(Candidate {
                        id: *id,
                        vec_sim: vec,
                        lex_score: lex,
                        last_accessed: event.ts,
                        confidence: event.importance,
                    });
                    events.insert(*id, event);
                }
            }
        }

        let ranked = search::blend(&candidates, self.weights(), Utc::now());
        Ok(ranked
            .into_iter()
            .take(k)
            .filter_map(|b| events.remove(&b.id).map(|e| (e, b.score)))
            .collect())
    }

    /// All events of one session, in chronological order.
    pub async fn recall_by_session(&self, session_id: &str) -> Result<Vec<Event>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE project = ?1 AND session_id = ?2 AND tombstone = 0
             ORDER BY ts ASC, id ASC"
        ))?;
        let events = stmt
            .query_map(params![self.config.project, session_id], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Events in a half-open time range `[since, until)`, chronological.
    pub async fn recall_by_time(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE project = ?1 AND ts >= ?2 AND ts < ?3 AND tombstone = 0
             ORDER BY ts ASC, id ASC"
        ))?;
        let events = stmt
            .query_map(params![self.config.project, since, until], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Soft-delete an event. Derived facts stay; their source links are
    /// tombstoned so derivation integrity checks keep passing.
    pub async fn soft_delete(&self, id: MemoryId) -> Result<()> {
        let project = self.config.project.clone();
        let deleted = self
            .store
            .transaction(move |tx| {
                let now = Utc::now();
                let changed = tx.execute(
                    "UPDATE events SET tombstone = 1, updated_at = ?1
                     WHERE id = ?2 AND project = ?3 AND tombstone = 0",
                    params![now, id, project],
                )?;
                if changed == 0 {
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM events WHERE id = ?1 AND project = ?2",
                            params![id, project],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if exists.is_none() {
                        return Err(AthenaError::NotFound(format!("event {id}")));
                    }
                    return Ok(false); // already tombstoned; idempotent
                }
                tx.execute(
                    "UPDATE fact_sources SET tombstoned = 1 WHERE event_id = ?1",
                    params![id],
                )?;
                tx.execute(
                    "INSERT INTO meta_events (project, kind, layer, memory_ref, detail, created_at)
                     VALUES (?1, 'soft_delete', 'episodic', ?2, NULL, ?3)",
                    params![project, id, now],
                )?;
                Ok(true)
            })
            .await?;
        if deleted {
            self.store.unindex(Layer::Episodic, id);
        }
        Ok(())
    }

    /// Events eligible for consolidation: old enough, live, not yet
    /// consolidated, newest first, bounded by `limit`.
    pub(crate) async fn consolidation_window(
        &self,
        min_age: std::time::Duration,
        max_age: std::time::Duration,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let now = Utc::now();
        let newest = now - chrono::Duration::from_std(min_age).unwrap_or_default();
        let oldest = now - chrono::Duration::from_std(max_age).unwrap_or_default();
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE project = ?1 AND tombstone = 0 AND consolidated = 0
               AND ts <= ?2 AND ts >= ?3
             ORDER BY ts DESC, id DESC LIMIT ?4"
        ))?;
        let events = stmt
            .query_map(
                params![self.config.project, newest, oldest, limit as i64],
                event_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn weights(&self) -> HybridWeights {
        HybridWeights {
            alpha: self.config.hybrid_alpha,
            beta: self.config.recency_beta,
            halflife: self.config.recency_halflife,
        }
    }
}

fn filter_matches(event: &Event, filter: &EventFilter) -> bool {
    if let Some(session) = &filter.session_id {
        if event.session_id.as_deref() != Some(session.as_str()) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if event.ts < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if event.ts >= until {
            return false;
        }
    }
    if let Some(min) = filter.min_importance {
        if event.importance < min {
            return false;
        }
    }
    filter
        .tags
        .iter()
        .all(|t| event.tags.iter().any(|have| have == &t.trim().to_lowercase()))
}

// ============================================================================
// TESTS
// ============================================================================
