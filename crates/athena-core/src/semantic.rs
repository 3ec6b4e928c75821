//! Semantic Layer
//!
//! Facts: distilled knowledge with confidence, topics, and provenance.
//! Unlike events, facts are mutable — confidence moves with evidence and
//! merges union topics — but every `derived_from` link must resolve to an
//! event in the same project, and background processes may only lower
//! confidence with a recorded meta event.
//!
//! Retrieval supports vector-only, lexical-only (FTS5/BM25 over
//! content + topics), and hybrid blending, hybrid being the default.

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

/// A semantic memory, possibly derived from events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    /// Row id
    pub id: MemoryId,
    /// Tenant key
    pub project: String,
    /// The fact statement
    pub content: String,
    /// Normalized topic set
    pub topics: Vec<String>,
    /// Confidence in [0,1]
    pub confidence: f64,
    /// Whether an embedding is stored
    pub has_embedding: bool,
    /// Stored without an embedding because the service was down
    pub degraded: bool,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update
    pub updated_at: DateTime<Utc>,
    /// Last retrieval touch, drives the recency boost
    pub last_accessed: DateTime<Utc>,
}

/// Input for storing a fact
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FactDraft {
    /// The fact statement
    pub content: String,
    /// Topics; normalized on write
    #[serde(default)]
    pub topics: Vec<String>,
    /// Confidence in [0,1]; defaults to 0.5
    pub confidence: Option<f64>,
    /// Source events this fact was derived from
    #[serde(default)]
    pub derived_from: Vec<MemoryId>,
}

/// One provenance link of a fact
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationLink {
    /// Source event id
    pub event_id: MemoryId,
    /// Set when the source event was soft-deleted
    pub tombstoned: bool,
}

/// Which retrieval modality to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetrievalMode {
    /// Embedding similarity only
    Vector,
    /// FTS5/BM25 only
    Lexical,
    /// Blended (default)
    #[default]
    Hybrid,
}

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let topics_json: String = row.get("topics")?;
    Ok(Fact {
        id: row.get("id")?,
        project: row.get("project")?,
        content: row.get("content")?,
        topics: serde_json::from_str(&topics_json).unwrap_or_default(),
        confidence: row.get("confidence")?,
        has_embedding: row.get::<_, Option<Vec<u8>>>("embedding")?.is_some(),
        degraded: row.get::<_, i64>("degraded")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_accessed: row.get("last_accessed")?,
    })
}

const FACT_COLUMNS: &str =
    "id, project, content, topics, confidence, embedding, degraded, created_at, updated_at, last_accessed";

// ============================================================================
// LAYER
// ============================================================================

/// Semantic layer over the durable store
#[derive(Clone)]
pub struct SemanticLayer {
    store: Store,
    config: std::sync::Arc<EngineConfig>,
}

impl SemanticLayer {
    pub(crate) fn new(store: Store, config: std::sync::Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Insert a fact inside an open transaction, validating that every
    /// `derived_from` id names an event in this project.
    pub(crate) fn insert_in_tx(&self, tx: &Transaction<'_>, draft: &FactDraft) -> Result<Fact> {
        if draft.content.trim().is_empty() {
            return Err(AthenaError::Invalid("fact content must not be empty".to_string()));
        }
        let confidence = draft.confidence.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(AthenaError::Invalid(format!(
                "confidence must be in [0,1], got {confidence}"
            )));
        }

        for event_id in &draft.derived_from {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT id FROM events WHERE id = ?1 AND project = ?2",
                    params![event_id, self.config.project],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(AthenaError::NotFound(format!(
                    "derived_from event {event_id}"
                )));
            }
        }

        let now = Utc::now();
        let topics = normalize_tags(&draft.topics);
        tx.execute(
            "INSERT INTO facts (project, content, topics, confidence, created_at, updated_at,
                                last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)",
            params![
                self.config.project,
                draft.content,
                serde_json::to_string(&topics)?,
                confidence,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO fact_sources (fact_id, event_id) VALUES (?1, ?2)",
            )?;
            for event_id in &draft.derived_from {
                stmt.execute(params![id, event_id])?;
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO meta_quality
                 (project, layer, memory_ref, access_count, useful_count, usefulness_score,
                  confidence, last_accessed)
             VALUES (?1, 'semantic', ?2, 0, 0, 0.5, ?3, ?4)",
            params![self.config.project, id, confidence, now],
        )?;

        self.get_in_conn(tx, id)?
            .ok_or_else(|| AthenaError::NotFound(format!("fact {id}")))
    }

    /// Store the embedding for a fact and update the vector index.
    pub(crate) async fn set_embedding(&self, id: MemoryId, vector: &[f32]) -> Result<()> {
        let blob = crate::embedding::to_bytes(vector);
        {
            let writer = self.store.writer().await;
            writer.execute(
                "UPDATE facts SET embedding = ?1, degraded = 0, updated_at = ?2
                 WHERE id = ?3 AND project = ?4",
                params![blob, Utc::now(), id, self.config.project],
            )?;
        }
        self.store.index_embedding(Layer::Semantic, id, vector);
        Ok(())
    }

    /// Flag a fact as stored without an embedding.
    pub(crate) async fn mark_degraded(&self, id: MemoryId) -> Result<()> {
        let writer = self.store.writer().await;
        writer.execute(
            "UPDATE facts SET degraded = 1, updated_at = ?1 WHERE id = ?2 AND project = ?3",
            params![Utc::now(), id, self.config.project],
        )?;
        Ok(())
    }

    /// Fetch one fact by id.
    pub async fn get(&self, id: MemoryId) -> Result<Option<Fact>> {
        let reader = self.store.reader().await?;
        self.get_in_conn(&reader, id)
    }

    pub(crate) fn get_in_conn(&self, conn: &Connection, id: MemoryId) -> Result<Option<Fact>> {
        let fact = conn
            .query_row(
                &format!("SELECT {FACT_COLUMNS} FROM facts WHERE id = ?1 AND project = ?2"),
                params![id, self.config.project],
                fact_from_row,
            )
            .optional()?;
        Ok(fact)
    }

    /// Provenance links of a fact, including tombstoned ones.
    pub async fn derivation_links(&self, fact_id: MemoryId) -> Result<Vec<DerivationLink>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(
            "SELECT event_id, tombstoned FROM fact_sources WHERE fact_id = ?1 ORDER BY event_id",
        )?;
        let links = stmt
            .query_map(params![fact_id], |row| {
                Ok(DerivationLink {
                    event_id: row.get(0)?,
                    tombstoned: row.get::<_, i64>(1)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Search facts in the requested mode. Deterministic for identical
    /// inputs, indexes, and config.
    pub async fn search(
        &self,
        query: &str,
        query_vec: Option<&[f32]>,
        mode: RetrievalMode,
        k: usize,
    ) -> Result<Vec<(Fact, f64)>> {
        if k == 0 || (query.trim().is_empty() && query_vec.is_none()) {
            return Ok(Vec::new());
        }
        let fetch = k.saturating_mul(3).max(k);

        let mut lex_hits: Vec<(MemoryId, f64)> = Vec::new();
        if mode != RetrievalMode::Vector {
            let match_expr = search::sanitize_fts5_query(query);
            if !match_expr.is_empty() {
                let reader = self.store.reader().await?;
                let mut stmt = reader.prepare_cached(
                    "SELECT f.id, bm25(facts_fts) AS rank
                     FROM facts_fts JOIN facts f ON f.id = facts_fts.rowid
                     WHERE facts_fts MATCH ?1 AND f.project = ?2
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

        let vec_hits: Vec<(MemoryId, f32)> = match (mode, query_vec) {
            (RetrievalMode::Lexical, _) | (_, None) => Vec::new(),
            (_, Some(qv)) => self.store.vector_search(Layer::Semantic, qv, fetch, |_| true),
        };

        let mut ids: Vec<MemoryId> = lex_hits.iter().map(|(id, _)| *id).collect();
        ids.extend(vec_hits.iter().map(|(id, _)| *id));
        ids.sort_unstable();
        ids.dedup();

        let alpha = match mode {
            RetrievalMode::Vector => 1.0,
            RetrievalMode::Lexical => 0.0,
            RetrievalMode::Hybrid => self.config.hybrid_alpha,
        };
        let weights = HybridWeights {
            alpha,
            beta: self.config.recency_beta,
            halflife: self.config.recency_halflife,
        };

        let mut candidates = Vec::new();
        let mut facts = std::collections::HashMap::new();
        {
            let reader = self.store.reader().await?;
            for id in &ids {
                if let Some(fact) = self.get_in_conn(&reader, *id)? {
                    let lex = lex_hits.iter().find(|(i, _)| i == id).map(|(_, s)| *s);
                    let vec = vec_hits
                        .iter()
                        .find(|(i, _)| i == id)
                        .map(|(_, s)| f64::from(*s));
                    candidates.push(Candidate {
                        id: *id,
                        vec_sim: vec,
                        lex_score: lex,
                        last_accessed: fact.last_accessed,
                        confidence: fact.confidence,
                    });
                    facts.insert(*id, fact);
                }
            }
        }

        let ranked = search::blend(&candidates, weights, Utc::now());
        Ok(ranked
            .into_iter()
            .take(k)
            .filter_map(|b| facts.remove(&b.id).map(|f| (f, b.score)))
            .collect())
    }

    /// Touch `last_accessed` after a retrieval served this fact.
    pub(crate) async fn touch(&self, id: MemoryId) -> Result<()> {
        let writer = self.store.writer().await;
        writer.execute(
            "UPDATE facts SET last_accessed = ?1 WHERE id = ?2 AND project = ?3",
            params![Utc::now(), id, self.config.project],
        )?;
        Ok(())
    }

    /// Update a fact's confidence. `actor` distinguishes callers from
    /// background processes: a background decrease is recorded as a meta
    /// event, never silent.
    pub async fn update_confidence(&self, id: MemoryId, confidence: f64, actor: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(AthenaError::Invalid(format!(
                "confidence must be in [0,1], got {confidence}"
            )));
        }
        let project = self.config.project.clone();
        let actor = actor.to_string();
        self.store
            .transaction(move |tx| {
                let previous: Option<f64> = tx
                    .query_row(
                        "SELECT confidence FROM facts WHERE id = ?1 AND project = ?2",
                        params![id, project],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(previous) = previous else {
                    return Err(AthenaError::NotFound(format!("fact {id}")));
                };
                let now = Utc::now();
                tx.execute(
                    "UPDATE facts SET confidence = ?1, updated_at = ?2
                     WHERE id = ?3 AND project = ?4",
                    params![confidence, now, id, project],
                )?;
                if confidence < previous {
                    tx.execute(
                        "INSERT INTO meta_events (project, kind, layer, memory_ref, detail, created_at)
                         VALUES (?1, 'confidence_decrease', 'semantic', ?2, ?3, ?4)",
                        params![
                            project,
                            id,
                            format!("{previous:.3} -> {confidence:.3} by {actor}"),
                            now
                        ],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Merge `other` into `keep`: topics and provenance are unioned,
    /// confidence takes the max, and `other` is removed.
    pub async fn merge(&self, keep: MemoryId, other: MemoryId) -> Result<Fact> {
        let project = self.config.project.clone();
        let this = self.clone();
        let merged = self
            .store
            .transaction(move |tx| {
                let target = this
                    .get_in_conn(tx, keep)?
                    .ok_or_else(|| AthenaError::NotFound(format!("fact {keep}")))?;
                let source = this
                    .get_in_conn(tx, other)?
                    .ok_or_else(|| AthenaError::NotFound(format!("fact {other}")))?;

                let mut topics = target.topics.clone();
                topics.extend(source.topics.clone());
                let topics = normalize_tags(topics);
                let confidence = target.confidence.max(source.confidence);
                let now = Utc::now();

                tx.execute(
                    "UPDATE facts SET topics = ?1, confidence = ?2, updated_at = ?3
                     WHERE id = ?4 AND project = ?5",
                    params![serde_json::to_string(&topics)?, confidence, now, keep, project],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO fact_sources (fact_id, event_id, tombstoned)
                     SELECT ?1, event_id, tombstoned FROM fact_sources WHERE fact_id = ?2",
                    params![keep, other],
                )?;
                tx.execute("DELETE FROM facts WHERE id = ?1 AND project = ?2", params![other, project])?;
                tx.execute(
                    "INSERT INTO meta_events (project, kind, layer, memory_ref, detail, created_at)
                     VALUES (?1, 'fact_merge', 'semantic', ?2, ?3, ?4)",
                    params![project, keep, format!("absorbed fact {other}"), now],
                )?;

                this.get_in_conn(tx, keep)?
                    .ok_or_else(|| AthenaError::NotFound(format!("fact {keep}")))
            })
            .await?;
        self.store.unindex(Layer::Semantic, other);
        Ok(merged)
    }
}

// ============================================================================
// TESTS
// ============================================================================
