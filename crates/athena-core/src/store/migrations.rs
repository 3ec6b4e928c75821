//! Database Migrations
//!
//! Forward-only schema migrations, applied transactionally at open.

use crate::error::{AthenaError, Result};

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Core layers: events, facts, procedures, FTS indexes",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Prospective layer (tasks, goals, triggers) and knowledge graph",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Meta layer: quality tracking, domain coverage, consolidation runs",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Core layers
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    session_id TEXT,
    ts TEXT NOT NULL,
    content TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    importance REAL NOT NULL DEFAULT 0.5,
    source TEXT,
    embedding BLOB,
    degraded INTEGER NOT NULL DEFAULT 0,
    consolidated INTEGER NOT NULL DEFAULT 0,
    tombstone INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_project_ts ON events(project, ts);
CREATE INDEX IF NOT EXISTS idx_events_session ON events(project, session_id);
CREATE INDEX IF NOT EXISTS idx_events_consolidated ON events(project, consolidated);

-- Tag edges for exact tag filtering (the tags column keeps the canonical set)
CREATE TABLE IF NOT EXISTS event_tags (
    event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (event_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_event_tags_tag ON event_tags(tag);

CREATE TABLE IF NOT EXISTS facts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    content TEXT NOT NULL,
    topics TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 0.5,
    embedding BLOB,
    degraded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_facts_project ON facts(project);

-- Fact -> source event links; tombstoned when the source event is
-- soft-deleted so derivation integrity checks keep passing
CREATE TABLE IF NOT EXISTS fact_sources (
    fact_id INTEGER NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
    event_id INTEGER NOT NULL REFERENCES events(id),
    tombstoned INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (fact_id, event_id)
);

CREATE INDEX IF NOT EXISTS idx_fact_sources_event ON fact_sources(event_id);

CREATE TABLE IF NOT EXISTS procedures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    steps TEXT NOT NULL DEFAULT '[]',
    category TEXT NOT NULL DEFAULT 'general',
    success_rate REAL NOT NULL DEFAULT 0.5,
    usage_count INTEGER NOT NULL DEFAULT 0,
    last_used TEXT,
    created_by TEXT NOT NULL DEFAULT 'user',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project, name)
);

-- FTS5 virtual tables for lexical retrieval
CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
    content, tags,
    content='events',
    content_rowid='id',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS events_ai AFTER INSERT ON events BEGIN
    INSERT INTO events_fts(rowid, content, tags)
    VALUES (NEW.id, NEW.content, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS events_ad AFTER DELETE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, content, tags)
    VALUES ('delete', OLD.id, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS events_au AFTER UPDATE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, content, tags)
    VALUES ('delete', OLD.id, OLD.content, OLD.tags);
    INSERT INTO events_fts(rowid, content, tags)
    VALUES (NEW.id, NEW.content, NEW.tags);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    content, topics,
    content='facts',
    content_rowid='id',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
    INSERT INTO facts_fts(rowid, content, topics)
    VALUES (NEW.id, NEW.content, NEW.topics);
END;

CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, content, topics)
    VALUES ('delete', OLD.id, OLD.content, OLD.topics);
END;

CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, content, topics)
    VALUES ('delete', OLD.id, OLD.content, OLD.topics);
    INSERT INTO facts_fts(rowid, content, topics)
    VALUES (NEW.id, NEW.content, NEW.topics);
END;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Prospective layer and knowledge graph
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS goals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    priority INTEGER NOT NULL DEFAULT 5,
    deadline TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    goal_id INTEGER REFERENCES goals(id),
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    priority INTEGER NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'pending',
    phase INTEGER NOT NULL DEFAULT 1,
    depends_on TEXT NOT NULL DEFAULT '[]',
    owner_agent_id TEXT,
    claim_version INTEGER NOT NULL DEFAULT 0,
    claimed_at TEXT,
    result TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_project_status ON tasks(project, status);
CREATE INDEX IF NOT EXISTS idx_tasks_goal ON tasks(goal_id);

CREATE TABLE IF NOT EXISTS triggers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    kind TEXT NOT NULL,
    spec TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_fired TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_triggers_project_kind ON triggers(project, kind, enabled);

-- One heartbeat row per agent; the reaper joins this against owned tasks
CREATE TABLE IF NOT EXISTS agent_heartbeats (
    project TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (project, agent_id)
);

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL DEFAULT 'generic',
    properties TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project, name, entity_type)
);

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    src INTEGER NOT NULL REFERENCES entities(id),
    dst INTEGER NOT NULL REFERENCES entities(id),
    relation_type TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 1.0,
    valid_from TEXT,
    valid_until TEXT,
    context TEXT,
    source_event_id INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_relations_src ON relations(project, src);
CREATE INDEX IF NOT EXISTS idx_relations_dst ON relations(project, dst);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Meta layer and consolidation audit trail
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS meta_quality (
    project TEXT NOT NULL,
    layer TEXT NOT NULL,
    memory_ref INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    useful_count INTEGER NOT NULL DEFAULT 0,
    usefulness_score REAL NOT NULL DEFAULT 0.5,
    confidence REAL NOT NULL DEFAULT 0.5,
    last_accessed TEXT NOT NULL,
    PRIMARY KEY (project, layer, memory_ref)
);

CREATE TABLE IF NOT EXISTS domain_coverage (
    project TEXT NOT NULL,
    domain TEXT NOT NULL,
    expertise TEXT NOT NULL DEFAULT 'beginner',
    evidence_count INTEGER NOT NULL DEFAULT 0,
    last_update TEXT NOT NULL,
    PRIMARY KEY (project, domain)
);

-- Audit trail for background mutations (preemptions, confidence changes)
CREATE TABLE IF NOT EXISTS meta_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    kind TEXT NOT NULL,
    layer TEXT,
    memory_ref INTEGER,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_meta_events_kind ON meta_events(project, kind);

CREATE TABLE IF NOT EXISTS consolidation_runs (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    profile TEXT NOT NULL,
    metrics TEXT NOT NULL DEFAULT '{}',
    accepted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_consolidation_runs_project ON consolidation_runs(project, started_at);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations. Returns the number applied.
///
/// A database newer than this binary is fatal: downgrades are not supported.
pub fn apply_migrations(conn: &rusqlite::Connection) -> Result<u32> {
    let current_version = get_current_version(conn)?;
    let supported = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if current_version > supported {
        return Err(AthenaError::SchemaMismatch {
            found: current_version,
            supported,
        });
    }

    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_in_order() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(
            get_current_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );
    }

    #[test]
    fn test_migrations_are_idempotent_at_head() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_future_schema_is_fatal() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        conn.execute(
            "UPDATE schema_version SET version = 99",
            [],
        )
        .unwrap();
        let err = apply_migrations(&conn).unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[test]
    fn test_versions_strictly_increase() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}
