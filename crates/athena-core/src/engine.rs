//! Unified Memory Engine
//!
//! The single entry point for every read and write. The engine owns the
//! store, the eight layers, the retrieval pipeline, and the consolidation
//! engine; background workers receive a cheap clone, never a global. All
//! public operations are deadline-bounded by `op_timeout` and scoped to
//! the configured project.
//!
//! Writes that span layers (an event plus its meta back-reference plus
//! any event triggers it fires) share one transaction: either everything
//! is durable and visible together, or nothing is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::consolidation::{
    ConsolidationEngine, ConsolidationReport, ProfileParams, RuleValidator, RunRecord, Validator,
};
use crate::embedding::{Embedder, EmbeddingGate, HashEmbedder};
use crate::episodic::{Event, EventDraft, EventFilter, EpisodicLayer};
use crate::error::{AthenaError, Result};
use crate::events::{EventBus, MemoryEvent};
use crate::graph::{Entity, GraphLayer, Neighbor, Relation, RelationDraft};
use crate::meta::{DomainCoverage, MemoryQuality, MetaLayer, WorkingItem};
use crate::procedural::{Procedure, ProceduralLayer, ProcedureDraft, ProcedureStats};
use crate::prospective::{
    Goal, ProspectiveLayer, Task, TaskDraft, TaskStatus, Trigger, TriggerEvaluator, TriggerSpec,
};
use crate::retrieval::{
    ExtractiveSummarizer, HeuristicRewriter, OverlapJudge, QueryRewriter, RelevanceJudge,
    RetrievalPipeline, RetrievalRequest, RetrievalResponse, Summarizer,
};
use crate::semantic::{Fact, FactDraft, SemanticLayer};
use crate::store::{with_retry, Store};
use crate::types::{Layer, MemoryId, MemoryRef};

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Engine`]; capabilities default to the deterministic
/// local stand-ins so the engine runs complete without any model host.
pub struct EngineBuilder {
    config: EngineConfig,
    db_path: Option<PathBuf>,
    embedder: Option<Arc<dyn Embedder>>,
    use_embedder: bool,
    validator: Arc<dyn Validator>,
    rewriter: Arc<dyn QueryRewriter>,
    judge: Arc<dyn RelevanceJudge>,
    summarizer: Arc<dyn Summarizer>,
}

impl EngineBuilder {
    /// Start a builder from a config
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            db_path: None,
            embedder: None,
            use_embedder: true,
            validator: Arc::new(RuleValidator::default()),
            rewriter: Arc::new(HeuristicRewriter),
            judge: Arc::new(OverlapJudge),
            summarizer: Arc::new(ExtractiveSummarizer),
        }
    }

    /// Database file path (default: the platform data directory)
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Inject an external embedding service
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self.use_embedder = true;
        self
    }

    /// Run fully lexical: no embedder at all, every row degraded
    pub fn without_embedder(mut self) -> Self {
        self.embedder = None;
        self.use_embedder = false;
        self
    }

    /// Inject an external cluster validator (LLM judge)
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Inject a query rewriter
    pub fn rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Inject a relevance judge
    pub fn judge(mut self, judge: Arc<dyn RelevanceJudge>) -> Self {
        self.judge = judge;
        self
    }

    /// Inject a narrative summarizer
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Open the store and assemble the engine
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let store = Store::open(self.db_path, &config)?;

        let gate = if self.use_embedder {
            let embedder = self
                .embedder
                .unwrap_or_else(|| Arc::new(HashEmbedder::new(config.embedding_dim)));
            if embedder.dim() != config.embedding_dim {
                return Err(AthenaError::Invalid(format!(
                    "embedder dim {} != configured embedding_dim {}",
                    embedder.dim(),
                    config.embedding_dim
                )));
            }
            Some(EmbeddingGate::new(
                embedder,
                config.embed_concurrency,
                config.embed_timeout,
            ))
        } else {
            None
        };

        let episodic = EpisodicLayer::new(store.clone(), config.clone());
        let semantic = SemanticLayer::new(store.clone(), config.clone());
        let procedural = ProceduralLayer::new(store.clone(), config.clone());
        let prospective = ProspectiveLayer::new(store.clone(), config.clone());
        let graph = GraphLayer::new(store.clone(), config.clone());
        let meta = MetaLayer::new(store.clone(), config.clone());
        let bus = EventBus::new();

        let pipeline = RetrievalPipeline::new(
            episodic.clone(),
            semantic.clone(),
            gate.clone(),
            self.rewriter,
            self.judge,
            self.summarizer,
            config.clone(),
        );
        let consolidation = ConsolidationEngine::new(
            store.clone(),
            episodic.clone(),
            semantic.clone(),
            procedural.clone(),
            graph.clone(),
            self.validator,
            bus.clone(),
            config.clone(),
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                store,
                gate,
                episodic,
                semantic,
                procedural,
                prospective,
                graph,
                meta,
                pipeline,
                consolidation,
                bus,
            }),
        })
    }
}

struct EngineInner {
    config: Arc<EngineConfig>,
    store: Store,
    gate: Option<EmbeddingGate>,
    episodic: EpisodicLayer,
    semantic: SemanticLayer,
    procedural: ProceduralLayer,
    prospective: ProspectiveLayer,
    graph: GraphLayer,
    meta: MetaLayer,
    pipeline: RetrievalPipeline,
    consolidation: ConsolidationEngine,
    bus: EventBus,
}

/// A memory fetched through a cross-layer reference
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "camelCase")]
pub enum MemoryItem {
    /// An episodic event
    Episodic(Event),
    /// A semantic fact
    Semantic(Fact),
    /// A procedure
    Procedural(Procedure),
    /// A task
    Prospective(Task),
    /// A graph entity
    Graph(Entity),
}

/// Aggregate row counts and coverage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Live events
    pub events: i64,
    /// Events carrying an embedding
    pub events_with_embeddings: i64,
    /// Facts
    pub facts: i64,
    /// Procedures
    pub procedures: i64,
    /// Tasks
    pub tasks: i64,
    /// Entities
    pub entities: i64,
    /// Relations
    pub relations: i64,
    /// Oldest event time
    pub oldest_event: Option<DateTime<Utc>>,
    /// Newest event time
    pub newest_event: Option<DateTime<Utc>>,
}

/// The unified memory engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Builder with the given config
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Open with defaults at a path (tests, simple embedding hosts)
    pub fn open(config: EngineConfig, db_path: impl Into<PathBuf>) -> Result<Self> {
        EngineBuilder::new(config).db_path(db_path).build()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to the typed event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MemoryEvent> {
        self.inner.bus.subscribe()
    }

    /// Bound a future by the configured operation deadline.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.inner.config.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AthenaError::DeadlineExceeded(self.inner.config.op_timeout)),
        }
    }

    // ========================================================================
    // WRITE API
    // ========================================================================

    /// Record an event: row, tag edges, meta back-reference, and any EVENT
    /// triggers fire in one transaction; embedding follows best-effort.
    pub async fn record_event(&self, draft: EventDraft) -> Result<Event> {
        self.bounded(self.record_event_inner(draft)).await
    }

    async fn record_event_inner(&self, draft: EventDraft) -> Result<Event> {
        let _slot = self.inner.store.ingest_slot()?;

        let inner = &self.inner;
        let event = with_retry(inner.config.retry_attempts, || {
            let draft = draft.clone();
            let episodic = inner.episodic.clone();
            let prospective = inner.prospective.clone();
            async move {
                let episodic_tx = episodic.clone();
                episodic
                    .store()
                    .transaction(move |tx| {
                        let event = episodic_tx.insert_in_tx(tx, &draft)?;
                        TriggerEvaluator::fire_event_in_tx(&prospective, tx, &event.tags)?;
                        Ok(event)
                    })
                    .await
            }
        })
        .await?;

        // Best-effort embedding after commit; failure leaves the row
        // lexical-only and flagged.
        if let Some(gate) = &inner.gate {
            match gate.embed(&event.content).await {
                Ok(vector) => inner.episodic.set_embedding(event.id, &vector).await?,
                Err(err) => {
                    tracing::warn!("event {} stored degraded: {err}", event.id);
                    inner.episodic.mark_degraded(event.id).await?;
                    inner.bus.publish(MemoryEvent::Degraded {
                        memory_ref: MemoryRef::event(event.id),
                    });
                }
            }
        } else {
            inner.episodic.mark_degraded(event.id).await?;
        }

        let load = inner.meta.recompute_attention().await?;
        if load >= 0.9 {
            inner.bus.publish(MemoryEvent::Pressure { load });
        }
        inner.bus.publish(MemoryEvent::EventRecorded {
            event_id: event.id,
            session_id: event.session_id.clone(),
        });
        self.get_event(event.id)
            .await?
            .ok_or_else(|| AthenaError::NotFound(format!("event {}", event.id)))
    }

    /// Store a fact with validated provenance; embeds best-effort.
    pub async fn store_fact(&self, draft: FactDraft) -> Result<Fact> {
        self.bounded(async {
            let inner = &self.inner;
            let semantic = inner.semantic.clone();
            let draft_tx = draft.clone();
            let fact = inner
                .store
                .transaction(move |tx| semantic.insert_in_tx(tx, &draft_tx))
                .await?;

            if let Some(gate) = &inner.gate {
                match gate.embed(&fact.content).await {
                    Ok(vector) => inner.semantic.set_embedding(fact.id, &vector).await?,
                    Err(err) => {
                        tracing::warn!("fact {} stored degraded: {err}", fact.id);
                        inner.semantic.mark_degraded(fact.id).await?;
                        inner.bus.publish(MemoryEvent::Degraded {
                            memory_ref: MemoryRef::fact(fact.id),
                        });
                    }
                }
            } else {
                inner.semantic.mark_degraded(fact.id).await?;
            }
            inner.meta.recompute_attention().await?;
            inner
                .semantic
                .get(fact.id)
                .await?
                .ok_or_else(|| AthenaError::NotFound(format!("fact {}", fact.id)))
        })
        .await
    }

    /// Register or update a workflow.
    pub async fn upsert_procedure(&self, draft: ProcedureDraft) -> Result<Procedure> {
        self.bounded(async {
            let procedural = self.inner.procedural.clone();
            self.inner
                .store
                .transaction(move |tx| procedural.upsert_in_tx(tx, &draft))
                .await
        })
        .await
    }

    /// Record one procedure execution outcome.
    pub async fn record_procedure_outcome(&self, id: MemoryId, success: bool) -> Result<Procedure> {
        self.bounded(self.inner.procedural.record_outcome(id, success))
            .await
    }

    /// Create a task.
    pub async fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        self.bounded(async {
            let prospective = self.inner.prospective.clone();
            self.inner
                .store
                .transaction(move |tx| prospective.create_in_tx(tx, &draft))
                .await
        })
        .await
    }

    /// Create a goal.
    pub async fn create_goal(
        &self,
        title: &str,
        description: &str,
        priority: i64,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Goal> {
        self.bounded(
            self.inner
                .prospective
                .create_goal(title, description, priority, deadline),
        )
        .await
    }

    /// Drive a task through the state machine (idempotent per state).
    pub async fn update_task_status(
        &self,
        id: MemoryId,
        status: TaskStatus,
        result: Option<String>,
    ) -> Result<Task> {
        let task = self
            .bounded(self.inner.prospective.update_status(id, status, result))
            .await?;
        if task.status == TaskStatus::Completed {
            self.inner
                .bus
                .publish(MemoryEvent::TaskCompleted { task_id: task.id });
        }
        Ok(task)
    }

    /// Claim a task for an agent. Exactly one concurrent claimer gets
    /// `Ok(true)`; the rest observe [`AthenaError::AlreadyClaimed`].
    pub async fn claim_task(&self, id: MemoryId, agent_id: &str) -> Result<bool> {
        self.bounded(async {
            self.inner.prospective.claim(id, agent_id).await?;
            Ok(true)
        })
        .await
    }

    /// Record that an agent is alive.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.bounded(self.inner.prospective.heartbeat(agent_id)).await
    }

    /// Register a trigger for a task.
    pub async fn create_trigger(&self, spec: TriggerSpec, task_id: MemoryId) -> Result<Trigger> {
        self.bounded(self.inner.prospective.create_trigger(spec, task_id))
            .await
    }

    /// Report the ambient context; CONTEXT triggers evaluate against it.
    pub async fn update_context(&self, description: &str) -> Result<usize> {
        self.bounded(TriggerEvaluator::fire_context(
            &self.inner.prospective,
            description,
        ))
        .await
    }

    /// Upsert a graph entity.
    pub async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        properties: serde_json::Value,
    ) -> Result<Entity> {
        self.bounded(self.inner.graph.upsert_entity(name, entity_type, properties))
            .await
    }

    /// Insert a graph relation.
    pub async fn upsert_relation(&self, draft: RelationDraft) -> Result<Relation> {
        self.bounded(self.inner.graph.upsert_relation(draft)).await
    }

    /// Close an ongoing relation.
    pub async fn close_relation(&self, id: MemoryId, at: DateTime<Utc>) -> Result<()> {
        self.bounded(self.inner.graph.close_relation(id, at)).await
    }

    /// Caller feedback on a served memory.
    pub async fn mark_useful(&self, memory_ref: MemoryRef, useful: bool) -> Result<()> {
        self.bounded(self.inner.meta.mark_useful(memory_ref, useful))
            .await
    }

    /// Count evidence toward a domain's expertise ladder.
    pub async fn record_domain_evidence(&self, domain: &str) -> Result<DomainCoverage> {
        self.bounded(self.inner.meta.record_domain_evidence(domain))
            .await
    }

    /// Soft-delete an event (tombstones provenance links).
    pub async fn soft_delete_event(&self, id: MemoryId) -> Result<()> {
        self.bounded(self.inner.episodic.soft_delete(id)).await
    }

    // ========================================================================
    // READ API
    // ========================================================================

    /// Run a retrieval request through the pipeline. Served memories are
    /// counted as accesses in the meta layer.
    pub async fn query(&self, request: RetrievalRequest) -> Result<RetrievalResponse> {
        self.bounded(async {
            let response = self.inner.pipeline.run(&request).await?;
            for item in &response.items {
                self.inner.meta.record_access(item.memory_ref).await.ok();
            }
            Ok(response)
        })
        .await
    }

    /// Fetch any memory by cross-layer reference.
    pub async fn get(&self, memory_ref: MemoryRef) -> Result<MemoryItem> {
        self.bounded(async {
            let missing = || AthenaError::NotFound(memory_ref.to_string());
            match memory_ref.layer {
                Layer::Episodic => self
                    .inner
                    .episodic
                    .get(memory_ref.id)
                    .await?
                    .map(MemoryItem::Episodic)
                    .ok_or_else(missing),
                Layer::Semantic => self
                    .inner
                    .semantic
                    .get(memory_ref.id)
                    .await?
                    .map(MemoryItem::Semantic)
                    .ok_or_else(missing),
                Layer::Procedural => self
                    .inner
                    .procedural
                    .get(memory_ref.id)
                    .await?
                    .map(MemoryItem::Procedural)
                    .ok_or_else(missing),
                Layer::Prospective => self
                    .inner
                    .prospective
                    .get(memory_ref.id)
                    .await?
                    .map(MemoryItem::Prospective)
                    .ok_or_else(missing),
                Layer::Graph => self
                    .inner
                    .graph
                    .get_entity(memory_ref.id)
                    .await?
                    .map(MemoryItem::Graph)
                    .ok_or_else(missing),
            }
        })
        .await
    }

    /// Fetch one event.
    pub async fn get_event(&self, id: MemoryId) -> Result<Option<Event>> {
        self.bounded(self.inner.episodic.get(id)).await
    }

    /// Fetch one task.
    pub async fn get_task(&self, id: MemoryId) -> Result<Option<Task>> {
        self.bounded(self.inner.prospective.get(id)).await
    }

    /// Tasks in a state, priority order.
    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.bounded(self.inner.prospective.list_by_status(status))
            .await
    }

    /// Quality record for one memory.
    pub async fn quality(&self, memory_ref: MemoryRef) -> Result<Option<MemoryQuality>> {
        self.bounded(self.inner.meta.quality(memory_ref)).await
    }

    /// Current working-memory projection (top-W snapshot).
    pub fn working_memory(&self) -> Arc<Vec<WorkingItem>> {
        self.inner.meta.working_memory()
    }

    /// Working-set pressure in [0,1].
    pub fn cognitive_load(&self) -> f64 {
        self.inner.meta.cognitive_load()
    }

    /// Graph neighborhood, optionally at a point in time.
    pub async fn neighbors(
        &self,
        entity_id: MemoryId,
        max_hops: u32,
        at_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Neighbor>> {
        self.bounded(self.inner.graph.neighbors(entity_id, max_hops, at_time))
            .await
    }

    /// Modularity communities over the current graph snapshot.
    pub async fn communities(&self, resolution: f64) -> Result<Arc<Vec<Vec<MemoryId>>>> {
        self.bounded(self.inner.graph.community_detect(resolution))
            .await
    }

    /// Chronological events of one session.
    pub async fn timeline_session(&self, session_id: &str) -> Result<Vec<Event>> {
        self.bounded(self.inner.episodic.recall_by_session(session_id))
            .await
    }

    /// Chronological events in `[since, until)`.
    pub async fn timeline_range(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        self.bounded(self.inner.episodic.recall_by_time(since, until))
            .await
    }

    /// Hybrid episodic recall with filters.
    pub async fn recall_events(
        &self,
        query: &str,
        filter: &EventFilter,
        k: usize,
    ) -> Result<Vec<(Event, f64)>> {
        self.bounded(async {
            let query_vec = match &self.inner.gate {
                Some(gate) => gate.embed(query).await.ok(),
                None => None,
            };
            self.inner
                .episodic
                .recall(query, query_vec.as_deref(), filter, k)
                .await
        })
        .await
    }

    /// Lexical procedure search.
    pub async fn search_procedures(&self, query: &str, k: usize) -> Result<Vec<(Procedure, f64)>> {
        self.bounded(self.inner.procedural.search(query, k)).await
    }

    /// Procedural layer statistics.
    pub async fn procedure_statistics(&self) -> Result<ProcedureStats> {
        self.bounded(self.inner.procedural.statistics()).await
    }

    /// Domain coverage records.
    pub async fn domain_coverage(&self) -> Result<Vec<DomainCoverage>> {
        self.bounded(self.inner.meta.domain_coverage()).await
    }

    /// Aggregate row counts.
    pub async fn stats(&self) -> Result<EngineStats> {
        self.bounded(async {
            let reader = self.inner.store.reader().await?;
            let project = self.inner.config.project.as_str();
            let count = |sql: &str| -> Result<i64> {
                Ok(reader.query_row(sql, rusqlite::params![project], |row| row.get(0))?)
            };
            let (oldest, newest) = reader.query_row(
                "SELECT MIN(ts), MAX(ts) FROM events WHERE project = ?1 AND tombstone = 0",
                rusqlite::params![project],
                |row| {
                    Ok((
                        row.get::<_, Option<DateTime<Utc>>>(0)?,
                        row.get::<_, Option<DateTime<Utc>>>(1)?,
                    ))
                },
            )?;
            Ok(EngineStats {
                events: count("SELECT COUNT(*) FROM events WHERE project = ?1 AND tombstone = 0")?,
                events_with_embeddings: count(
                    "SELECT COUNT(*) FROM events
                     WHERE project = ?1 AND tombstone = 0 AND embedding IS NOT NULL",
                )?,
                facts: count("SELECT COUNT(*) FROM facts WHERE project = ?1")?,
                procedures: count("SELECT COUNT(*) FROM procedures WHERE project = ?1")?,
                tasks: count("SELECT COUNT(*) FROM tasks WHERE project = ?1")?,
                entities: count("SELECT COUNT(*) FROM entities WHERE project = ?1")?,
                relations: count("SELECT COUNT(*) FROM relations WHERE project = ?1")?,
                oldest_event: oldest,
                newest_event: newest,
            })
        })
        .await
    }

    // ========================================================================
    // CONSOLIDATION API
    // ========================================================================

    /// Run consolidation now. Not deadline-bounded: runs are long by
    /// design and cancellable instead.
    pub async fn consolidate(
        &self,
        profile: Option<&str>,
        window: Option<usize>,
    ) -> Result<ConsolidationReport> {
        self.inner.consolidation.run(profile, window).await
    }

    /// Run consolidation with explicit (custom-profile) parameters.
    pub async fn consolidate_with(
        &self,
        params: ProfileParams,
        window: Option<usize>,
    ) -> Result<ConsolidationReport> {
        self.inner.consolidation.run_with("custom", params, window).await
    }

    /// Request cooperative cancellation of the running consolidation.
    pub fn cancel_consolidation(&self) {
        self.inner.consolidation.request_cancel();
    }

    /// Past consolidation runs, newest first.
    pub async fn consolidation_stats(&self) -> Result<Vec<RunRecord>> {
        self.inner.consolidation.stats().await
    }

    /// Reserved deep-consolidation cycle. Intentionally a no-op returning
    /// an empty accepted report: the behavior is not specified, and
    /// guessing here would corrupt long-term memory.
    pub async fn dream(&self) -> Result<ConsolidationReport> {
        let now = Utc::now();
        Ok(ConsolidationReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            profile: "dream".to_string(),
            events_in: 0,
            clusters: 0,
            facts_out: 0,
            procedures_out: 0,
            relations_out: 0,
            pending_review: 0,
            metrics: crate::consolidation::RunMetrics {
                consistency: 1.0,
                ..Default::default()
            },
            accepted: true,
            cancelled: false,
            started_at: now,
            finished_at: now,
        })
    }

    // ========================================================================
    // BACKGROUND WORKERS
    // ========================================================================

    /// Start the background clocks: the heartbeat tick (attention
    /// recompute + stale-task reaper + TIME triggers) and scheduled
    /// consolidation. Workers hold engine clones and stop when the
    /// returned handle is dropped or shut down.
    pub fn spawn_workers(&self) -> BackgroundWorkers {
        let mut handles = Vec::new();

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.inner.config.heartbeat_tick);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match engine.inner.prospective.reap_stale().await {
                    Ok(preempted) => {
                        for task_id in preempted {
                            engine
                                .inner
                                .bus
                                .publish(MemoryEvent::TaskPreempted { task_id });
                        }
                    }
                    Err(err) => tracing::warn!("reaper tick failed: {err}"),
                }
                if let Err(err) = TriggerEvaluator::tick_time(&engine.inner.prospective).await {
                    tracing::warn!("time trigger tick failed: {err}");
                }
                match engine.inner.meta.recompute_attention().await {
                    Ok(load) if load >= 0.9 => {
                        engine.inner.bus.publish(MemoryEvent::Pressure { load });
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("attention tick failed: {err}"),
                }
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.inner.config.consolidation_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick; consolidating an empty fresh
            // store at startup is pointless.
            tick.tick().await;
            loop {
                tick.tick().await;
                match engine.consolidate(None, None).await {
                    Ok(report) => tracing::info!(
                        "scheduled consolidation {}: accepted={} facts={}",
                        report.run_id,
                        report.accepted,
                        report.facts_out
                    ),
                    // Background runs never abort the engine.
                    Err(err) => tracing::warn!("scheduled consolidation failed: {err}"),
                }
            }
        }));

        BackgroundWorkers {
            handles,
            watcher: None,
        }
    }

    /// Start the debounced FILE-trigger watcher over `root`.
    pub fn watch_files(&self, root: &Path) -> Result<BackgroundWorkers> {
        let (watcher, handle) = TriggerEvaluator::spawn_file_watcher(
            self.inner.prospective.clone(),
            root,
            self.inner.config.file_debounce,
        )?;
        Ok(BackgroundWorkers {
            handles: vec![handle],
            watcher: Some(watcher),
        })
    }
}

/// Handles to spawned background workers; aborts them on drop
pub struct BackgroundWorkers {
    handles: Vec<tokio::task::JoinHandle<()>>,
    watcher: Option<notify::RecommendedWatcher>,
}

impl BackgroundWorkers {
    /// Stop all workers now
    pub fn shutdown(&mut self) {
        self.watcher = None;
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder(EngineConfig::for_project("engine-tests"))
            .db_path(dir.path().join("athena.db"))
            .build()
            .unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let (_dir, engine) = engine();
        let event = engine
            .record_event(EventDraft {
                content: "engine smoke test".to_string(),
                tags: vec!["smoke".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(event.has_embedding); // default hash embedder ran

        match engine.get(MemoryRef::event(event.id)).await.unwrap() {
            MemoryItem::Episodic(read) => assert_eq!(read.content, "engine smoke test"),
            other => panic!("wrong layer: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, engine) = engine();
        let err = engine.get(MemoryRef::fact(404)).await.unwrap_err();
        assert!(matches!(err, AthenaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_event_stream_publishes_record() {
        let (_dir, engine) = engine();
        let mut rx = engine.subscribe();
        let event = engine
            .record_event(EventDraft {
                content: "published".to_string(),
                session_id: Some("sess".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        // Skip any attention/degraded notifications until the record event.
        loop {
            match rx.recv().await.unwrap() {
                MemoryEvent::EventRecorded { event_id, session_id } => {
                    assert_eq!(event_id, event.id);
                    assert_eq!(session_id.as_deref(), Some("sess"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_without_embedder_marks_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder(EngineConfig::for_project("engine-tests"))
            .db_path(dir.path().join("athena.db"))
            .without_embedder()
            .build()
            .unwrap();
        let event = engine
            .record_event(EventDraft {
                content: "lexical only".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let read = engine.get_event(event.id).await.unwrap().unwrap();
        assert!(read.degraded);
        assert!(!read.has_embedding);
    }

    #[tokio::test]
    async fn test_working_memory_bounded_after_writes() {
        let (_dir, engine) = engine();
        for i in 0..10 {
            engine
                .record_event(EventDraft {
                    content: format!("event {i}"),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        assert!(engine.working_memory().len() <= engine.config().working_memory_limit);
        assert!(engine.cognitive_load() <= 1.0);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (_dir, engine) = engine();
        engine
            .record_event(EventDraft {
                content: "one event".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        engine
            .store_fact(FactDraft {
                content: "one fact".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.facts, 1);
        assert_eq!(stats.events_with_embeddings, 1);
        assert!(stats.oldest_event.is_some());
    }

    #[tokio::test]
    async fn test_dream_is_a_noop() {
        let (_dir, engine) = engine();
        let report = engine.dream().await.unwrap();
        assert!(report.accepted);
        assert_eq!(report.events_in, 0);
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.facts, 0);
    }
}
