//! Durable Store
//!
//! Typed persistence for every layer: an async connection pool over SQLite
//! (WAL), forward-only migrations, transactional cross-layer writes, and
//! the per-layer vector indexes rebuilt from stored embedding blobs at
//! open. The write path is additionally gated by an ingest soft cap so a
//! saturated pool sheds load with `IngestBusy` instead of queueing without
//! bound.

mod migrations;
mod pool;

pub use migrations::{apply_migrations, get_current_version, MIGRATIONS};
pub use pool::{Pool, ReaderGuard, WriterGuard};

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusqlite::TransactionBehavior;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::EngineConfig;
use crate::embedding::from_bytes;
use crate::error::{AthenaError, Result};
use crate::search::VectorIndex;
use crate::types::Layer;

/// Durable store: pool + ingest gate + vector indexes
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    ingest_permits: Arc<Semaphore>,
    ingest_cap: usize,
    event_index: Arc<RwLock<VectorIndex>>,
    fact_index: Arc<RwLock<VectorIndex>>,
}

impl Store {
    /// Open (or create) the store. `None` uses the platform data directory.
    pub fn open(db_path: Option<PathBuf>, config: &EngineConfig) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = directories::ProjectDirs::from("io", "athena", "core").ok_or_else(
                    || AthenaError::Invalid("could not determine data directory".to_string()),
                )?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir).map_err(|e| {
                    AthenaError::StoreUnavailable(format!("create data dir: {e}"))
                })?;
                data_dir.join("athena.db")
            }
        };

        let pool = Pool::open(&path, config.pool_readers)?;

        let store = Self {
            pool,
            ingest_permits: Arc::new(Semaphore::new(config.ingest_soft_cap)),
            ingest_cap: config.ingest_soft_cap,
            event_index: Arc::new(RwLock::new(VectorIndex::new(config.embedding_dim))),
            fact_index: Arc::new(RwLock::new(VectorIndex::new(config.embedding_dim))),
        };
        store.load_indexes(&config.project)?;
        Ok(store)
    }

    /// Rebuild the in-memory vector indexes from stored blobs.
    fn load_indexes(&self, project: &str) -> Result<()> {
        // Bootstrap runs before any async caller exists, so a blocking
        // connection open here is fine; steady-state access goes through
        // the pool.
        let load = |table: &str, index: &RwLock<VectorIndex>| -> Result<usize> {
            let conn = self.pool_blocking_reader()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT id, embedding FROM {table} WHERE project = ?1 AND embedding IS NOT NULL"
            ))?;
            let rows: Vec<(i64, Vec<u8>)> = stmt
                .query_map([project], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;
            drop(stmt);

            let mut index = index
                .write()
                .map_err(|_| AthenaError::StoreUnavailable("index lock poisoned".to_string()))?;
            let mut loaded = 0;
            for (id, blob) in rows {
                if let Some(vector) = from_bytes(&blob) {
                    if index.add(id, &vector) {
                        loaded += 1;
                    }
                }
            }
            Ok(loaded)
        };

        let events = load("events", &self.event_index)?;
        let facts = load("facts", &self.fact_index)?;
        if events + facts > 0 {
            tracing::info!("loaded {} event and {} fact embeddings", events, facts);
        }
        Ok(())
    }

    /// Synchronous reader used only during open, before the runtime exists.
    fn pool_blocking_reader(&self) -> Result<ReaderGuard> {
        self.pool.try_reader().ok_or_else(|| {
            AthenaError::StoreUnavailable("no reader available at open".to_string())
        })
    }

    /// Acquire a reader connection.
    pub async fn reader(&self) -> Result<ReaderGuard> {
        self.pool.reader().await
    }

    /// Acquire the writer connection without a transaction.
    pub async fn writer(&self) -> WriterGuard<'_> {
        self.pool.writer().await
    }

    /// Run `f` inside one IMMEDIATE transaction. All cross-layer writes
    /// that must be atomic go through here; any error rolls back.
    pub async fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut writer = self.pool.writer().await;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Reserve an ingest slot; fails fast with `IngestBusy` at the soft cap.
    pub fn ingest_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.ingest_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| AthenaError::IngestBusy(self.ingest_cap))
    }

    /// The vector index backing a layer (`None` for layers without one).
    pub fn index(&self, layer: Layer) -> Option<&Arc<RwLock<VectorIndex>>> {
        match layer {
            Layer::Episodic => Some(&self.event_index),
            Layer::Semantic => Some(&self.fact_index),
            _ => None,
        }
    }

    /// Top-k rows of `layer` by cosine similarity, filtered by `keep`.
    pub fn vector_search(
        &self,
        layer: Layer,
        query: &[f32],
        k: usize,
        keep: impl Fn(i64) -> bool,
    ) -> Vec<(i64, f32)> {
        let Some(index) = self.index(layer) else {
            return Vec::new();
        };
        match index.read() {
            Ok(index) => index.search(query, k, keep),
            Err(_) => Vec::new(),
        }
    }

    /// Record a freshly stored embedding in the layer index.
    pub fn index_embedding(&self, layer: Layer, id: i64, vector: &[f32]) {
        if let Some(index) = self.index(layer) {
            if let Ok(mut index) = index.write() {
                index.add(id, vector);
            }
        }
    }

    /// Drop a row from the layer index (soft delete).
    pub fn unindex(&self, layer: Layer, id: i64) {
        if let Some(index) = self.index(layer) {
            if let Ok(mut index) = index.write() {
                index.remove(id);
            }
        }
    }
}

/// Retry a transient-failing operation with jittered exponential backoff.
///
/// Only errors whose [`AthenaError::retryable`] is true are retried;
/// everything else surfaces immediately.
pub async fn with_retry<T, Fut>(attempts: u32, mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    use rand::Rng;

    let mut delay = Duration::from_millis(50);
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempt + 1 < attempts => {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                tracing::debug!(
                    "retrying after {}: attempt {}/{}",
                    err.kind(),
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                delay *= 2;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| AthenaError::StoreUnavailable("retries exhausted".to_string())))
}

// ============================================================================
// TESTS
// ============================================================================
