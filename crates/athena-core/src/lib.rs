//! # Athena Core
//!
//! Persistent memory substrate for long-running AI agents. Heterogeneous
//! experiences stream in, land in typed durable layers, and come back out
//! through semantic, structural, and temporal queries with bounded latency
//! and token cost.
//!
//! - **Episodic layer**: append-only timestamped events with tags,
//!   importance, and sessions
//! - **Semantic layer**: facts with hybrid (vector + lexical + recency)
//!   retrieval and event provenance
//! - **Procedural layer**: named workflows with a running-mean success rate
//! - **Prospective layer**: tasks with a strict lifecycle FSM, atomic
//!   multi-agent claiming, and time/event/context/dependency/file triggers
//! - **Knowledge graph**: entities and time-bounded relations with
//!   modularity community detection
//! - **Meta layer**: usefulness feedback, domain expertise, and the top-W
//!   working-memory projection
//! - **Retrieval pipeline**: direct/hyde/rerank/transform/reflective/
//!   self-rag/corrective strategies with token-budget compaction
//! - **Consolidation engine**: dual-process (statistical clustering plus
//!   conditional validation) promotion of events into facts, procedures,
//!   and relations, with accept-or-rollback quality gates
//!
//! Embedders, validators, rewriters, judges, and summarizers are injected
//! capabilities; deterministic local stand-ins ship in the crate, so the
//! whole engine runs without any external model host.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use athena_core::{Engine, EngineConfig, EventDraft, RetrievalRequest};
//!
//! let engine = Engine::builder(EngineConfig::for_project("assistant"))
//!     .db_path("athena.db")
//!     .build()?;
//!
//! let event = engine.record_event(EventDraft {
//!     content: "deployed service A at 10:00".into(),
//!     tags: vec!["deploy".into(), "a".into()],
//!     session_id: Some("sess1".into()),
//!     ..Default::default()
//! }).await?;
//!
//! let response = engine.query(RetrievalRequest {
//!     query_text: "what happened to service A".into(),
//!     ..Default::default()
//! }).await?;
//! ```

// Only warn about missing docs at the crate level; internal fields and
// enum variants don't need individual documentation.
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consolidation;
pub mod embedding;
pub mod engine;
pub mod episodic;
pub mod error;
pub mod events;
pub mod graph;
pub mod meta;
pub mod procedural;
pub mod prospective;
pub mod retrieval;
pub mod search;
pub mod semantic;
pub mod store;
pub mod types;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::EngineConfig;
pub use engine::{BackgroundWorkers, Engine, EngineBuilder, EngineStats, MemoryItem};
pub use error::{AthenaError, Result};
pub use events::{EventBus, MemoryEvent};
pub use types::{Layer, MemoryId, MemoryRef};

// Layers
pub use episodic::{Event, EventDraft, EventFilter};
pub use graph::{Entity, Neighbor, Relation, RelationDraft};
pub use meta::{DomainCoverage, Expertise, MemoryQuality, WorkingItem};
pub use procedural::{Procedure, ProcedureDraft, ProcedureOrigin, ProcedureStats, ProcedureStep};
pub use prospective::{Goal, Task, TaskDraft, TaskStatus, Trigger, TriggerSpec};
pub use semantic::{DerivationLink, Fact, FactDraft, RetrievalMode};

// Capabilities
pub use consolidation::{ClusterDigest, DerivationKind, RuleValidator, Validator, Verdict};
pub use embedding::{cosine_similarity, Embedder, EmbeddingGate, HashEmbedder};
pub use retrieval::{
    ExtractiveSummarizer, HeuristicRewriter, OverlapJudge, QueryRewriter, RankedMemory,
    RelevanceJudge, RetrievalPipeline, RetrievalRequest, RetrievalResponse, Strategy, Summarizer,
};

// Consolidation
pub use consolidation::{
    ConsolidationEngine, ConsolidationReport, ProfileParams, RunMetrics, RunRecord,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AthenaError, Engine, EngineConfig, Event, EventDraft, EventFilter, Fact, FactDraft,
        Layer, MemoryEvent, MemoryItem, MemoryRef, Procedure, ProcedureDraft, Result,
        RetrievalRequest, RetrievalResponse, Strategy, Task, TaskDraft, TaskStatus, TriggerSpec,
    };
}
