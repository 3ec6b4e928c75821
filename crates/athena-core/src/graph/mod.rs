//! Knowledge Graph Layer
//!
//! Entities and directed, optionally time-bounded relations. Entities live
//! in an id-keyed arena; relations carry ids, never ownership, so traversal
//! is plain id lookup and the graph cannot form reference cycles. A null
//! `valid_until` means the relation is ongoing; neighbor expansion at time
//! `t` only crosses relations whose `[valid_from, valid_until)` window
//! contains `t`.

mod community;

pub use community::{detect as community_detect_raw, CommunityEdge};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use crate::config::EngineConfig;
use crate::error::{AthenaError, Result};
use crate::store::Store;
use crate::types::MemoryId;

// ============================================================================
// TYPES
// ============================================================================

/// A node in the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Row id
    pub id: MemoryId,
    /// Tenant key
    pub project: String,
    /// Display name, unique per (project, type)
    pub name: String,
    /// Entity type label
    pub entity_type: String,
    /// Open-shaped properties
    pub properties: serde_json::Value,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update
    pub updated_at: DateTime<Utc>,
}

/// A directed edge between entities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Row id
    pub id: MemoryId,
    /// Source entity
    pub src: MemoryId,
    /// Target entity
    pub dst: MemoryId,
    /// Relation type label
    pub relation_type: String,
    /// Strength in [0,1]
    pub strength: f64,
    /// When the relation started holding
    pub valid_from: Option<DateTime<Utc>>,
    /// When it stopped holding; `None` = ongoing
    pub valid_until: Option<DateTime<Utc>>,
    /// Free-form context note
    pub context: Option<String>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
}

impl Relation {
    /// Whether the relation held at `t` (`[valid_from, valid_until)`).
    pub fn holds_at(&self, t: DateTime<Utc>) -> bool {
        let after_start = self.valid_from.is_none_or(|from| t >= from);
        let before_end = self.valid_until.is_none_or(|until| t < until);
        after_start && before_end
    }
}

/// Input for upserting a relation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelationDraft {
    /// Source entity
    pub src: MemoryId,
    /// Target entity
    pub dst: MemoryId,
    /// Relation type label
    pub relation_type: String,
    /// Strength in [0,1]; defaults to 1.0
    pub strength: Option<f64>,
    /// When the relation started holding
    pub valid_from: Option<DateTime<Utc>>,
    /// When it stopped holding
    pub valid_until: Option<DateTime<Utc>>,
    /// Free-form context note
    pub context: Option<String>,
}

/// One hop of a neighbor expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    /// The reached entity
    pub entity: Entity,
    /// Hop count from the origin
    pub hops: u32,
    /// Type of the relation crossed to reach it
    pub via: String,
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let properties: String = row.get("properties")?;
    Ok(Entity {
        id: row.get("id")?,
        project: row.get("project")?,
        name: row.get("name")?,
        entity_type: row.get("entity_type")?,
        properties: serde_json::from_str(&properties)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn relation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        id: row.get("id")?,
        src: row.get("src")?,
        dst: row.get("dst")?,
        relation_type: row.get("relation_type")?,
        strength: row.get("strength")?,
        valid_from: row.get("valid_from")?,
        valid_until: row.get("valid_until")?,
        context: row.get("context")?,
        created_at: row.get("created_at")?,
    })
}

const ENTITY_COLUMNS: &str = "id, project, name, entity_type, properties, created_at, updated_at";
const RELATION_COLUMNS: &str =
    "id, src, dst, relation_type, strength, valid_from, valid_until, context, created_at";

type CommunityKey = (u32, i64, i64);

// ============================================================================
// LAYER
// ============================================================================

/// Knowledge graph layer over the durable store
#[derive(Clone)]
pub struct GraphLayer {
    store: Store,
    config: Arc<EngineConfig>,
    /// Snapshot cache for community detection, keyed by
    /// (schema_version, entity_count, relation_count)
    community_cache: Arc<RwLock<Option<(CommunityKey, Arc<Vec<Vec<MemoryId>>>)>>>,
}

impl GraphLayer {
    pub(crate) fn new(store: Store, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            config,
            community_cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Insert an entity or update its properties, keyed by (name, type).
    pub async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        properties: serde_json::Value,
    ) -> Result<Entity> {
        let this = self.clone();
        let name = name.to_string();
        let entity_type = entity_type.to_string();
        self.store
            .transaction(move |tx| this.upsert_entity_in_tx(tx, &name, &entity_type, &properties))
            .await
    }

    pub(crate) fn upsert_entity_in_tx(
        &self,
        tx: &Transaction<'_>,
        name: &str,
        entity_type: &str,
        properties: &serde_json::Value,
    ) -> Result<Entity> {
        if name.trim().is_empty() {
            return Err(AthenaError::Invalid("entity name must not be empty".to_string()));
        }
        let now = Utc::now();
        tx.execute(
            "INSERT INTO entities (project, name, entity_type, properties, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (project, name, entity_type)
             DO UPDATE SET properties = excluded.properties, updated_at = excluded.updated_at",
            params![
                self.config.project,
                name,
                entity_type,
                serde_json::to_string(properties)?,
                now,
            ],
        )?;
        let entity = tx
            .query_row(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE project = ?1 AND name = ?2 AND entity_type = ?3"
                ),
                params![self.config.project, name, entity_type],
                entity_from_row,
            )
            .optional()?;
        entity.ok_or_else(|| AthenaError::NotFound(format!("entity {name}")))
    }

    /// Fetch one entity by id.
    pub async fn get_entity(&self, id: MemoryId) -> Result<Option<Entity>> {
        let reader = self.store.reader().await?;
        self.get_entity_in_conn(&reader, id)
    }

    pub(crate) fn get_entity_in_conn(&self, conn: &Connection, id: MemoryId) -> Result<Option<Entity>> {
        let entity = conn
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1 AND project = ?2"),
                params![id, self.config.project],
                entity_from_row,
            )
            .optional()?;
        Ok(entity)
    }

    /// Find an entity by exact name (any type).
    pub async fn find_entity(&self, name: &str) -> Result<Option<Entity>> {
        let reader = self.store.reader().await?;
        let entity = reader
            .query_row(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE project = ?1 AND name = ?2 ORDER BY id LIMIT 1"
                ),
                params![self.config.project, name],
                entity_from_row,
            )
            .optional()?;
        Ok(entity)
    }

    /// Insert a relation. Both endpoints must exist; when both temporal
    /// bounds are set, `valid_from` must precede `valid_until`.
    pub async fn upsert_relation(&self, draft: RelationDraft) -> Result<Relation> {
        let this = self.clone();
        self.store
            .transaction(move |tx| this.upsert_relation_in_tx(tx, &draft))
            .await
    }

    pub(crate) fn upsert_relation_in_tx(
        &self,
        tx: &Transaction<'_>,
        draft: &RelationDraft,
    ) -> Result<Relation> {
        let strength = draft.strength.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&strength) {
            return Err(AthenaError::Invalid(format!(
                "strength must be in [0,1], got {strength}"
            )));
        }
        if let (Some(from), Some(until)) = (draft.valid_from, draft.valid_until) {
            if from >= until {
                return Err(AthenaError::Invalid(
                    "valid_from must precede valid_until".to_string(),
                ));
            }
        }
        for endpoint in [draft.src, draft.dst] {
            if self.get_entity_in_conn(tx, endpoint)?.is_none() {
                return Err(AthenaError::NotFound(format!("entity {endpoint}")));
            }
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO relations (project, src, dst, relation_type, strength, valid_from,
                                    valid_until, context, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                self.config.project,
                draft.src,
                draft.dst,
                draft.relation_type,
                strength,
                draft.valid_from,
                draft.valid_until,
                draft.context,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let relation = tx
            .query_row(
                &format!("SELECT {RELATION_COLUMNS} FROM relations WHERE id = ?1"),
                params![id],
                relation_from_row,
            )
            .optional()?;
        relation.ok_or_else(|| AthenaError::NotFound(format!("relation {id}")))
    }

    /// Close an ongoing relation at `at`.
    pub async fn close_relation(&self, id: MemoryId, at: DateTime<Utc>) -> Result<()> {
        let project = self.config.project.clone();
        self.store
            .transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE relations SET valid_until = ?1, updated_at = ?1
                     WHERE id = ?2 AND project = ?3 AND valid_until IS NULL",
                    params![at, id, project],
                )?;
                if changed == 0 {
                    return Err(AthenaError::NotFound(format!("open relation {id}")));
                }
                Ok(())
            })
            .await
    }

    /// Relations touching an entity (either direction).
    pub async fn relations_of(&self, entity_id: MemoryId) -> Result<Vec<Relation>> {
        let reader = self.store.reader().await?;
        let mut stmt = reader.prepare_cached(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations
             WHERE project = ?1 AND (src = ?2 OR dst = ?2) ORDER BY id"
        ))?;
        let relations = stmt
            .query_map(params![self.config.project, entity_id], relation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(relations)
    }

    /// Breadth-first neighbor expansion up to `max_hops`, optionally
    /// restricted to relations valid at `at_time`. Directional edges are
    /// walked both ways; results are hop-ordered, then id-ordered.
    pub async fn neighbors(
        &self,
        entity_id: MemoryId,
        max_hops: u32,
        at_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Neighbor>> {
        let reader = self.store.reader().await?;
        if self.get_entity_in_conn(&reader, entity_id)?.is_none() {
            return Err(AthenaError::NotFound(format!("entity {entity_id}")));
        }

        // Adjacency over the validity-filtered snapshot.
        let mut stmt = reader.prepare_cached(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations WHERE project = ?1 ORDER BY id"
        ))?;
        let relations: Vec<Relation> = stmt
            .query_map(params![self.config.project], relation_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut adjacency: HashMap<MemoryId, Vec<(MemoryId, &str)>> = HashMap::new();
        for r in &relations {
            if let Some(t) = at_time {
                if !r.holds_at(t) {
                    continue;
                }
            }
            adjacency
                .entry(r.src)
                .or_default()
                .push((r.dst, r.relation_type.as_str()));
            adjacency
                .entry(r.dst)
                .or_default()
                .push((r.src, r.relation_type.as_str()));
        }

        let mut seen: HashSet<MemoryId> = HashSet::from([entity_id]);
        let mut queue: VecDeque<(MemoryId, u32)> = VecDeque::from([(entity_id, 0)]);
        let mut reached: Vec<(MemoryId, u32, String)> = Vec::new();

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= max_hops {
                continue;
            }
            let mut next: Vec<(MemoryId, &str)> =
                adjacency.get(&current).cloned().unwrap_or_default();
            next.sort_by_key(|(id, _)| *id);
            for (neighbor, via) in next {
                if seen.insert(neighbor) {
                    reached.push((neighbor, hops + 1, via.to_string()));
                    queue.push_back((neighbor, hops + 1));
                }
            }
        }

        let mut out = Vec::with_capacity(reached.len());
        for (id, hops, via) in reached {
            if let Some(entity) = self.get_entity_in_conn(&reader, id)? {
                out.push(Neighbor { entity, hops, via });
            }
        }
        Ok(out)
    }

    /// Modularity communities over the call-time snapshot, cached under
    /// `(schema_version, entity_count, relation_count)`.
    pub async fn community_detect(&self, resolution: f64) -> Result<Arc<Vec<Vec<MemoryId>>>> {
        let reader = self.store.reader().await?;
        let entity_count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM entities WHERE project = ?1",
            params![self.config.project],
            |row| row.get(0),
        )?;
        let relation_count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM relations WHERE project = ?1",
            params![self.config.project],
            |row| row.get(0),
        )?;
        let schema_version = crate::store::MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        let key: CommunityKey = (schema_version, entity_count, relation_count);

        if let Ok(cache) = self.community_cache.read() {
            if let Some((cached_key, communities)) = cache.as_ref() {
                if *cached_key == key {
                    return Ok(Arc::clone(communities));
                }
            }
        }

        let mut stmt = reader.prepare_cached(
            "SELECT id FROM entities WHERE project = ?1 ORDER BY id",
        )?;
        let nodes: Vec<MemoryId> = stmt
            .query_map(params![self.config.project], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let index_of: HashMap<MemoryId, usize> =
            nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut stmt = reader.prepare_cached(
            "SELECT src, dst, strength FROM relations WHERE project = ?1 ORDER BY id",
        )?;
        let edges: Vec<CommunityEdge> = stmt
            .query_map(params![self.config.project], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(src, dst, weight)| {
                Some(CommunityEdge {
                    a: *index_of.get(&src)?,
                    b: *index_of.get(&dst)?,
                    weight,
                })
            })
            .collect();
        drop(stmt);
        drop(reader);

        let communities = Arc::new(community::detect(&nodes, &edges, resolution));
        if let Ok(mut cache) = self.community_cache.write() {
            *cache = Some((key, Arc::clone(&communities)));
        }
        Ok(communities)
    }
}

// ============================================================================
// TESTS
// ============================================================================
