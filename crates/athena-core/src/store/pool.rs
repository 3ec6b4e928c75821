//! Connection Pool
//!
//! One writer connection serialized behind an async mutex, plus a bounded
//! set of reader connections handed out through a semaphore. WAL mode lets
//! readers proceed while the writer commits. Guards return connections on
//! every exit path, including cancellation mid-acquire.

use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{AthenaError, Result};

/// Shared state behind the reader side of the pool
struct ReaderShared {
    connections: std::sync::Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

/// Async SQLite connection pool
#[derive(Clone)]
pub struct Pool {
    writer: Arc<tokio::sync::Mutex<Connection>>,
    readers: Arc<ReaderShared>,
}

impl Pool {
    /// Open the pool against a database file, applying PRAGMAs and
    /// migrations on the writer before any reader is created.
    pub fn open(path: &Path, reader_count: usize) -> Result<Self> {
        let writer = Connection::open(path)
            .map_err(|e| AthenaError::StoreUnavailable(format!("open writer: {e}")))?;
        configure_connection(&writer)?;
        super::migrations::apply_migrations(&writer)?;

        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count.max(1) {
            let conn = Connection::open(path)
                .map_err(|e| AthenaError::StoreUnavailable(format!("open reader: {e}")))?;
            configure_connection(&conn)?;
            readers.push(conn);
        }
        let count = readers.len();

        Ok(Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            readers: Arc::new(ReaderShared {
                connections: std::sync::Mutex::new(readers),
                permits: Arc::new(Semaphore::new(count)),
            }),
        })
    }

    /// Acquire the writer connection. Suspends until it is free.
    pub async fn writer(&self) -> WriterGuard<'_> {
        WriterGuard {
            guard: self.writer.lock().await,
        }
    }

    /// Acquire a reader connection. Suspends when all readers are out.
    pub async fn reader(&self) -> Result<ReaderGuard> {
        let permit = self
            .readers
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AthenaError::StoreUnavailable("pool closed".to_string()))?;
        self.take_reader(permit)
    }

    /// Non-blocking reader acquisition, for synchronous bootstrap paths.
    pub fn try_reader(&self) -> Option<ReaderGuard> {
        let permit = self.readers.permits.clone().try_acquire_owned().ok()?;
        self.take_reader(permit).ok()
    }

    fn take_reader(&self, permit: OwnedSemaphorePermit) -> Result<ReaderGuard> {
        let conn = {
            let mut free = self
                .readers
                .connections
                .lock()
                .map_err(|_| AthenaError::StoreUnavailable("reader pool poisoned".to_string()))?;
            free.pop()
        };
        match conn {
            Some(conn) => Ok(ReaderGuard {
                conn: Some(conn),
                shared: Arc::clone(&self.readers),
                _permit: permit,
            }),
            // A permit without a connection means a previous guard lost its
            // connection to a poisoned push-back; treat as transient.
            None => Err(AthenaError::StoreUnavailable(
                "reader pool exhausted".to_string(),
            )),
        }
    }
}

/// Apply PRAGMAs shared by every connection
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Exclusive access to the writer connection
pub struct WriterGuard<'a> {
    guard: tokio::sync::MutexGuard<'a, Connection>,
}

impl Deref for WriterGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl DerefMut for WriterGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.guard
    }
}

/// A checked-out reader connection, returned to the pool on drop
pub struct ReaderGuard {
    conn: Option<Connection>,
    shared: Arc<ReaderShared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ReaderGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mut free) = self.shared.connections.lock() {
                free.push(conn);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
