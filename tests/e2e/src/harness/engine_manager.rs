//! Test Engine Manager
//!
//! Provides isolated engine instances for testing: each instance gets its
//! own temporary database that is deleted on drop, so tests never
//! interfere with each other or leave state behind.

use std::path::PathBuf;
use std::sync::Arc;

use athena_core::{Embedder, Engine, EngineConfig, EventDraft};
use tempfile::TempDir;

/// An engine over a throwaway database
///
/// # Example
///
/// ```rust,ignore
/// let harness = TestEngine::new();
/// harness.engine.record_event(EventDraft { ... }).await?;
/// // database removed when `harness` drops
/// ```
pub struct TestEngine {
    /// The engine under test
    pub engine: Engine,
    /// Temporary directory (kept alive to prevent premature deletion)
    _temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestEngine {
    /// Engine with default config and the built-in hash embedder.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::for_project("e2e"))
    }

    /// Engine with a custom config.
    pub fn with_config(config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("create temp directory");
        let db_path = temp_dir.path().join("athena-e2e.db");
        let engine = Engine::builder(config)
            .db_path(db_path.clone())
            .build()
            .expect("build test engine");
        Self {
            engine,
            _temp_dir: temp_dir,
            db_path,
        }
    }

    /// Engine with an injected embedder (scripted vectors, etc.).
    pub fn with_embedder(config: EngineConfig, embedder: Arc<dyn Embedder>) -> Self {
        let temp_dir = TempDir::new().expect("create temp directory");
        let db_path = temp_dir.path().join("athena-e2e.db");
        let engine = Engine::builder(config)
            .db_path(db_path.clone())
            .embedder(embedder)
            .build()
            .expect("build test engine");
        Self {
            engine,
            _temp_dir: temp_dir,
            db_path,
        }
    }

    /// Fully lexical engine: no embedder, every row degraded.
    pub fn lexical_only(config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("create temp directory");
        let db_path = temp_dir.path().join("athena-e2e.db");
        let engine = Engine::builder(config)
            .db_path(db_path.clone())
            .without_embedder()
            .build()
            .expect("build test engine");
        Self {
            engine,
            _temp_dir: temp_dir,
            db_path,
        }
    }

    /// Reopen the same database with a different config (for config
    /// sensitivity tests, e.g. changing the hybrid blend).
    pub fn reopen_with(&self, config: EngineConfig, embedder: Option<Arc<dyn Embedder>>) -> Engine {
        let builder = Engine::builder(config).db_path(self.db_path.clone());
        let builder = match embedder {
            Some(e) => builder.embedder(e),
            None => builder,
        };
        builder.build().expect("reopen test engine")
    }

    /// Seed `count` simple events in one session.
    pub async fn seed_events(&self, count: usize, session: &str) -> Vec<i64> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let event = self
                .engine
                .record_event(EventDraft {
                    content: format!("seeded observation number {i}"),
                    tags: vec![format!("seed-{}", i % 5)],
                    session_id: Some(session.to_string()),
                    ..Default::default()
                })
                .await
                .expect("seed event");
            ids.push(event.id);
        }
        ids
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
