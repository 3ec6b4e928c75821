//! Error Types
//!
//! One typed error enum for the whole memory core. Every caller-visible
//! failure mode has its own variant; transient variants answer `true` to
//! [`AthenaError::retryable`] so callers (and the internal retry helper)
//! can tell a backoff-and-retry situation from a caller bug.

use std::time::Duration;

/// Memory core error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum AthenaError {
    /// Transient database issue; retry with backoff
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Optimistic lock or unique constraint; refetch and retry
    #[error("conflict: {0}")]
    Conflict(String),
    /// Schema constraint violation
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// Reference to a missing entity; never auto-created
    #[error("not found: {0}")]
    NotFound(String),
    /// Validation failure; caller bug
    #[error("invalid: {0}")]
    Invalid(String),
    /// Embedding service down or timed out; degraded mode
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    /// Another consolidation run is in progress for this project
    #[error("consolidation busy")]
    ConsolidationBusy,
    /// Run metrics fell below accept thresholds; nothing was written
    #[error("consolidation rejected: recall={recall:.3} consistency={consistency:.3}")]
    ConsolidationRejected {
        /// Fraction of input events traceable from emitted facts
        recall: f64,
        /// Fraction of emitted facts free of pairwise contradictions
        consistency: f64,
    },
    /// Task claim CAS lost to another agent
    #[error("already claimed: task {0}")]
    AlreadyClaimed(i64),
    /// Operation cancelled by its deadline
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    /// Caller-initiated cancellation; not an error for background work
    #[error("cancelled")]
    Cancelled,
    /// Ingest soft cap saturated; shed load
    #[error("ingest busy: {0} writes pending")]
    IngestBusy(usize),
    /// Database schema is ahead of this binary; requires migration
    #[error("schema mismatch: database at v{found}, binary supports v{supported}")]
    SchemaMismatch {
        /// Version found in the database
        found: u32,
        /// Highest version this binary knows
        supported: u32,
    },
}

impl AthenaError {
    /// Whether the caller may retry the operation after a backoff.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AthenaError::StoreUnavailable(_)
                | AthenaError::EmbeddingUnavailable(_)
                | AthenaError::ConsolidationBusy
                | AthenaError::IngestBusy(_)
        )
    }

    /// Short machine-readable kind tag, stable across messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AthenaError::StoreUnavailable(_) => "store_unavailable",
            AthenaError::Conflict(_) => "conflict",
            AthenaError::ConstraintViolation(_) => "constraint_violation",
            AthenaError::NotFound(_) => "not_found",
            AthenaError::Invalid(_) => "invalid",
            AthenaError::EmbeddingUnavailable(_) => "embedding_unavailable",
            AthenaError::ConsolidationBusy => "consolidation_busy",
            AthenaError::ConsolidationRejected { .. } => "consolidation_rejected",
            AthenaError::AlreadyClaimed(_) => "already_claimed",
            AthenaError::DeadlineExceeded(_) => "deadline_exceeded",
            AthenaError::Cancelled => "cancelled",
            AthenaError::IngestBusy(_) => "ingest_busy",
            AthenaError::SchemaMismatch { .. } => "schema_mismatch",
        }
    }
}

impl From<rusqlite::Error> for AthenaError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    AthenaError::StoreUnavailable(
                        msg.clone().unwrap_or_else(|| "database busy".to_string()),
                    )
                }
                rusqlite::ErrorCode::ConstraintViolation => AthenaError::ConstraintViolation(
                    msg.clone().unwrap_or_else(|| err.to_string()),
                ),
                _ => AthenaError::StoreUnavailable(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => {
                AthenaError::NotFound("query returned no rows".to_string())
            }
            _ => AthenaError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AthenaError {
    fn from(err: serde_json::Error) -> Self {
        AthenaError::Invalid(format!("json: {err}"))
    }
}

/// Memory core result type
pub type Result<T> = std::result::Result<T, AthenaError>;

// ============================================================================
// TESTS
// ============================================================================
