//! Retrieval Pipeline
//!
//! One entry point for every read strategy. The pipeline embeds the query
//! (LRU-cached), fans out to the episodic and semantic layers, blends and
//! ranks, then compacts the payload to the caller's token budget.
//!
//! Strategies beyond `direct` wrap the same base search: `hyde` searches
//! with a hypothetical-answer centroid, `rerank` re-scores a 3x candidate
//! pool through the judge, `transform` rewrites the query first,
//! `reflective` widens low-confidence results with session neighborhood,
//! `self_rag` re-queries until the judge is satisfied and attaches
//! citations, and `corrective` filters what the judge rejects. `adaptive`
//! picks a strategy from published query cues (length, pronouns, temporal
//! words).
//!
//! The rewriter, judge, and summarizer are injected capabilities with
//! deterministic local defaults, so the pipeline runs complete without
//! any external model host.

pub mod compaction;

pub use compaction::{compact, estimate_tokens};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::embedding::EmbeddingGate;
use crate::episodic::{EpisodicLayer, EventFilter};
use crate::error::Result;
use crate::search::{self, overlap_score};
use crate::semantic::{RetrievalMode, SemanticLayer};
use crate::types::{Layer, MemoryId, MemoryRef};

/// Confidence floor below which `reflective` expands its neighborhood
const REFLECTIVE_THRESHOLD: f64 = 0.5;

/// Maximum re-query rounds for `self_rag`
const SELF_RAG_ROUNDS: usize = 2;

/// Judge grade below which `corrective` rewrites the query
const CORRECTIVE_GRADE_FLOOR: f64 = 0.4;

/// Judge score below which `corrective` drops an item as irrelevant
const CORRECTIVE_ITEM_FLOOR: f64 = 0.2;

/// Query-embedding cache entries
const QUERY_CACHE_SIZE: usize = 128;

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Pluggable query rewrite (co-reference resolution, normalization)
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    /// Rewrite a query for better retrieval
    async fn rewrite(&self, query: &str) -> Result<String>;
    /// Capability name for diagnostics
    fn name(&self) -> &str;
}

/// Pluggable relevance judge (cross-encoder, LLM grader)
#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    /// Score query/document relevance in [0,1]
    async fn judge(&self, query: &str, document: &str) -> Result<f64>;
    /// Capability name for diagnostics
    fn name(&self) -> &str;
}

/// Pluggable narrative summarizer; output is advisory only
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize payload lines within a rough token budget
    async fn summarize(&self, lines: &[String], token_budget: usize) -> Result<String>;
    /// Capability name for diagnostics
    fn name(&self) -> &str;
}

/// Default rewriter: strips filler and dangling pronouns so the lexical
/// path matches on content words.
pub struct HeuristicRewriter;

#[async_trait]
impl QueryRewriter for HeuristicRewriter {
    async fn rewrite(&self, query: &str) -> Result<String> {
        const DROP: &[&str] = &[
            "it", "they", "them", "this", "that", "these", "those", "the", "a", "an", "please",
            "really", "just",
        ];
        let kept: Vec<&str> = query
            .split_whitespace()
            .filter(|w| {
                let bare = w
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase();
                !DROP.contains(&bare.as_str())
            })
            .collect();
        if kept.is_empty() {
            Ok(query.to_string())
        } else {
            Ok(kept.join(" "))
        }
    }

    fn name(&self) -> &str {
        "heuristic-rewriter"
    }
}

/// Default judge: term overlap between query and document. Stands in for
/// a cross-encoder with the same interface and deterministic output.
pub struct OverlapJudge;

#[async_trait]
impl RelevanceJudge for OverlapJudge {
    async fn judge(&self, query: &str, document: &str) -> Result<f64> {
        Ok(overlap_score(query, document))
    }

    fn name(&self) -> &str {
        "overlap-judge"
    }
}

/// Default summarizer: leading sentences of the top lines, cut to budget.
pub struct ExtractiveSummarizer;

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, lines: &[String], token_budget: usize) -> Result<String> {
        let mut out = String::new();
        for line in lines {
            let sentence = line.split(['.', '\n']).next().unwrap_or(line).trim();
            if sentence.is_empty() {
                continue;
            }
            if estimate_tokens(&out) + estimate_tokens(sentence) > token_budget {
                break;
            }
            out.push_str(sentence);
            out.push_str(". ");
        }
        Ok(out.trim_end().to_string())
    }

    fn name(&self) -> &str {
        "extractive-summarizer"
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// Retrieval strategies the pipeline recognizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One hybrid pass, top-k
    #[default]
    Direct,
    /// Search with a hypothetical-answer embedding
    Hyde,
    /// Retrieve 3k candidates, re-score with the judge
    Rerank,
    /// Rewrite the query, then direct
    Transform,
    /// Expand the neighborhood when confidence is low
    Reflective,
    /// Judge, re-query, and attach citations
    SelfRag,
    /// Grade, rewrite on low grade, filter irrelevant items
    Corrective,
    /// Pick from query cues (published rule)
    Adaptive,
}

impl Strategy {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Hyde => "hyde",
            Strategy::Rerank => "rerank",
            Strategy::Transform => "transform",
            Strategy::Reflective => "reflective",
            Strategy::SelfRag => "self_rag",
            Strategy::Corrective => "corrective",
            Strategy::Adaptive => "adaptive",
        }
    }
}

/// A retrieval request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalRequest {
    /// Free-text query
    pub query_text: String,
    /// Caller-declared intent (diagnostic only)
    pub intent: Option<String>,
    /// Layers to search; empty means episodic + semantic
    pub layers: Vec<Layer>,
    /// Episodic filters
    pub filters: EventFilter,
    /// Result count; defaults to 10
    pub k: Option<usize>,
    /// Strategy; defaults to `direct`
    pub strategy: Option<Strategy>,
    /// Token budget for the compacted payload
    pub token_budget: Option<usize>,
    /// Only consider episodic memories from before this instant
    pub at_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Caller-supplied hypothetical answer for `hyde`
    pub hypothetical: Option<String>,
    /// Request an advisory narrative summary
    pub with_summary: bool,
}

/// One ranked result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMemory {
    /// The memory served
    pub memory_ref: MemoryRef,
    /// Layer it came from
    pub layer: Layer,
    /// Final score (strategy-dependent scale, descending)
    pub score: f64,
    /// Which path produced it
    pub rationale_tag: String,
    /// Content snippet
    pub snippet: String,
    /// Supporting event ids (facts: live provenance)
    pub citations: Vec<MemoryId>,
}

/// Pipeline output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResponse {
    /// Ranked, budget-compacted payload (authoritative)
    pub items: Vec<RankedMemory>,
    /// Rendered context string for prompt assembly
    pub context: String,
    /// Advisory narrative summary, when requested
    pub summary: Option<String>,
    /// Strategy that actually ran (after `adaptive` resolution)
    pub strategy_used: Strategy,
    /// True when an embedding path fell back to lexical
    pub degraded: bool,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// The retrieval pipeline
#[derive(Clone)]
pub struct RetrievalPipeline {
    episodic: EpisodicLayer,
    semantic: SemanticLayer,
    embedder: Option<EmbeddingGate>,
    rewriter: Arc<dyn QueryRewriter>,
    judge: Arc<dyn RelevanceJudge>,
    summarizer: Arc<dyn Summarizer>,
    config: Arc<EngineConfig>,
    query_cache: Arc<Mutex<LruCache<String, Vec<f32>>>>,
}

impl RetrievalPipeline {
    pub(crate) fn new(
        episodic: EpisodicLayer,
        semantic: SemanticLayer,
        embedder: Option<EmbeddingGate>,
        rewriter: Arc<dyn QueryRewriter>,
        judge: Arc<dyn RelevanceJudge>,
        summarizer: Arc<dyn Summarizer>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            episodic,
            semantic,
            embedder,
            rewriter,
            judge,
            summarizer,
            config,
            query_cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            ))),
        }
    }

    /// Run a retrieval request end to end.
    pub async fn run(&self, request: &RetrievalRequest) -> Result<RetrievalResponse> {
        let k = request.k.unwrap_or(10);
        let requested = request.strategy.unwrap_or_default();
        let strategy = match requested {
            Strategy::Adaptive => self.pick_adaptive(&request.query_text),
            other => other,
        };

        let mut degraded = false;
        let items = if k == 0 || request.query_text.trim().is_empty() {
            Vec::new() // empty query: empty ranked list, not an error
        } else {
            match strategy {
                Strategy::Direct | Strategy::Adaptive => {
                    self.direct(request, k, &mut degraded, "direct").await?
                }
                Strategy::Hyde => self.hyde(request, k, &mut degraded).await?,
                Strategy::Rerank => self.rerank(request, k, &mut degraded).await?,
                Strategy::Transform => self.transform(request, k, &mut degraded).await?,
                Strategy::Reflective => self.reflective(request, k, &mut degraded).await?,
                Strategy::SelfRag => self.self_rag(request, k, &mut degraded).await?,
                Strategy::Corrective => self.corrective(request, k, &mut degraded).await?,
            }
        };

        let (items, context) = compact(items, request.token_budget);
        let summary = if request.with_summary && !items.is_empty() {
            let lines: Vec<String> = items.iter().map(|i| i.snippet.clone()).collect();
            let budget = request.token_budget.unwrap_or(256) / 4;
            match self.summarizer.summarize(&lines, budget.max(16)).await {
                Ok(text) if !text.is_empty() => Some(text),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!("summarizer {} failed: {err}", self.summarizer.name());
                    None
                }
            }
        } else {
            None
        };

        Ok(RetrievalResponse {
            items,
            context,
            summary,
            strategy_used: strategy,
            degraded,
        })
    }

    /// The published adaptive rule: short queries get hyde, pronoun-heavy
    /// queries get transform, temporal cues get reflective, the rest direct.
    pub fn pick_adaptive(&self, query: &str) -> Strategy {
        let cues = search::analyze(query);
        if cues.word_count < 5 {
            Strategy::Hyde
        } else if cues.pronoun_count > 0 {
            Strategy::Transform
        } else if cues.temporal {
            Strategy::Reflective
        } else {
            Strategy::Direct
        }
    }

    // ========================================================================
    // STRATEGY IMPLEMENTATIONS
    // ========================================================================

    async fn direct(
        &self,
        request: &RetrievalRequest,
        k: usize,
        degraded: &mut bool,
        tag: &str,
    ) -> Result<Vec<RankedMemory>> {
        let query_vec = self.embed_query(&request.query_text, degraded).await;
        self.base_search(request, &request.query_text, query_vec.as_deref(), k, tag)
            .await
    }

    async fn hyde(
        &self,
        request: &RetrievalRequest,
        k: usize,
        degraded: &mut bool,
    ) -> Result<Vec<RankedMemory>> {
        let Some(gate) = &self.embedder else {
            // No embedder at all: lexical direct, flagged degraded.
            *degraded = true;
            return self
                .base_search(request, &request.query_text, None, k, "hyde-fallback")
                .await;
        };

        let centroid = match &request.hypothetical {
            Some(text) => gate.embed(text).await.ok(),
            None => {
                let variants = search::expand_query(&request.query_text);
                let mut embeddings = Vec::with_capacity(variants.len());
                for variant in &variants {
                    match gate.embed(variant).await {
                        Ok(v) => embeddings.push(v),
                        Err(_) => break,
                    }
                }
                (embeddings.len() == variants.len())
                    .then(|| search::centroid_embedding(&embeddings))
            }
        };

        match centroid {
            Some(vector) => {
                self.base_search(request, &request.query_text, Some(&vector), k, "hyde-centroid")
                    .await
            }
            None => {
                // Embedding failed mid-flight: degrade to the lexical path.
                *degraded = true;
                self.base_search(request, &request.query_text, None, k, "hyde-fallback")
                    .await
            }
        }
    }

    async fn rerank(
        &self,
        request: &RetrievalRequest,
        k: usize,
        degraded: &mut bool,
    ) -> Result<Vec<RankedMemory>> {
        let pool = self
            .direct(request, k.saturating_mul(3), degraded, "rerank-pool")
            .await?;
        let mut rescored = Vec::with_capacity(pool.len());
        for mut item in pool {
            let judged = self
                .judge
                .judge(&request.query_text, &item.snippet)
                .await
                .unwrap_or(0.0);
            item.score = judged;
            item.rationale_tag = "reranked".to_string();
            rescored.push(item);
        }
        rescored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory_ref.id.cmp(&b.memory_ref.id))
        });
        rescored.truncate(k);
        Ok(rescored)
    }

    async fn transform(
        &self,
        request: &RetrievalRequest,
        k: usize,
        degraded: &mut bool,
    ) -> Result<Vec<RankedMemory>> {
        let rewritten = self
            .rewriter
            .rewrite(&request.query_text)
            .await
            .unwrap_or_else(|_| request.query_text.clone());
        let query_vec = self.embed_query(&rewritten, degraded).await;
        self.base_search(request, &rewritten, query_vec.as_deref(), k, "transformed")
            .await
    }

    async fn reflective(
        &self,
        request: &RetrievalRequest,
        k: usize,
        degraded: &mut bool,
    ) -> Result<Vec<RankedMemory>> {
        let mut items = self.direct(request, k, degraded, "reflective").await?;
        let confident = items
            .first()
            .map(|top| top.score >= REFLECTIVE_THRESHOLD)
            .unwrap_or(false);
        if confident {
            return Ok(items);
        }

        // Low confidence: pull the temporal neighborhood of the best
        // episodic hit (its session) and re-rank the union by the judge.
        let session = match items
            .iter()
            .find(|i| i.layer == Layer::Episodic)
            .map(|i| i.memory_ref.id)
        {
            Some(event_id) => self
                .episodic
                .get(event_id)
                .await?
                .and_then(|e| e.session_id),
            None => None,
        };
        if let Some(session_id) = session {
            let neighborhood = self.episodic.recall_by_session(&session_id).await?;
            for event in neighborhood {
                if items.iter().any(|i| {
                    i.layer == Layer::Episodic && i.memory_ref.id == event.id
                }) {
                    continue;
                }
                items.push(RankedMemory {
                    memory_ref: MemoryRef::event(event.id),
                    layer: Layer::Episodic,
                    score: 0.0,
                    rationale_tag: "reflective-neighborhood".to_string(),
                    snippet: event.content,
                    citations: vec![event.id],
                });
            }
        }

        for item in &mut items {
            let judged = self
                .judge
                .judge(&request.query_text, &item.snippet)
                .await
                .unwrap_or(0.0);
            item.score = (item.score + judged) / 2.0;
        }
        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory_ref.id.cmp(&b.memory_ref.id))
        });
        items.truncate(k);
        Ok(items)
    }

    async fn self_rag(
        &self,
        request: &RetrievalRequest,
        k: usize,
        degraded: &mut bool,
    ) -> Result<Vec<RankedMemory>> {
        let mut query = request.query_text.clone();
        let mut items = Vec::new();
        for round in 0..=SELF_RAG_ROUNDS {
            let query_vec = self.embed_query(&query, degraded).await;
            items = self
                .base_search(request, &query, query_vec.as_deref(), k, "self_rag")
                .await?;

            let mut grade = 0.0;
            for item in &items {
                grade += self
                    .judge
                    .judge(&request.query_text, &item.snippet)
                    .await
                    .unwrap_or(0.0);
            }
            let grade = if items.is_empty() {
                0.0
            } else {
                grade / items.len() as f64
            };
            if grade >= REFLECTIVE_THRESHOLD || round == SELF_RAG_ROUNDS {
                break;
            }
            // "no/partial": rewrite and try again.
            query = self.rewriter.rewrite(&query).await.unwrap_or(query);
        }
        Ok(items)
    }

    async fn corrective(
        &self,
        request: &RetrievalRequest,
        k: usize,
        degraded: &mut bool,
    ) -> Result<Vec<RankedMemory>> {
        let mut items = self.direct(request, k, degraded, "corrective").await?;

        let mut grade = 0.0;
        for item in &items {
            grade += self
                .judge
                .judge(&request.query_text, &item.snippet)
                .await
                .unwrap_or(0.0);
        }
        let grade = if items.is_empty() {
            0.0
        } else {
            grade / items.len() as f64
        };

        if grade < CORRECTIVE_GRADE_FLOOR {
            // Rewrite and widen: double the pool, ignore episodic filters.
            let rewritten = self
                .rewriter
                .rewrite(&request.query_text)
                .await
                .unwrap_or_else(|_| request.query_text.clone());
            let widened = RetrievalRequest {
                filters: EventFilter::default(),
                ..request.clone()
            };
            let query_vec = self.embed_query(&rewritten, degraded).await;
            items = self
                .base_search(
                    &widened,
                    &rewritten,
                    query_vec.as_deref(),
                    k.saturating_mul(2),
                    "corrective-widened",
                )
                .await?;
        }

        // Filter chunks the judge considers irrelevant.
        let mut filtered = Vec::with_capacity(items.len());
        for item in items {
            let judged = self
                .judge
                .judge(&request.query_text, &item.snippet)
                .await
                .unwrap_or(0.0);
            if judged >= CORRECTIVE_ITEM_FLOOR {
                filtered.push(item);
            }
        }
        filtered.truncate(k);
        Ok(filtered)
    }

    // ========================================================================
    // SHARED MACHINERY
    // ========================================================================

    /// Embed a query through the LRU cache; `None` flips the degraded flag
    /// when an embedder exists but is unavailable.
    async fn embed_query(&self, query: &str, degraded: &mut bool) -> Option<Vec<f32>> {
        let gate = self.embedder.as_ref()?;
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(hit) = cache.get(query) {
                return Some(hit.clone());
            }
        }
        match gate.embed(query).await {
            Ok(vector) => {
                if let Ok(mut cache) = self.query_cache.lock() {
                    cache.put(query.to_string(), vector.clone());
                }
                Some(vector)
            }
            Err(err) => {
                tracing::warn!("query embedding unavailable, lexical only: {err}");
                *degraded = true;
                None
            }
        }
    }

    /// Fan out to the requested layers and merge into one ranking.
    async fn base_search(
        &self,
        request: &RetrievalRequest,
        query: &str,
        query_vec: Option<&[f32]>,
        k: usize,
        tag: &str,
    ) -> Result<Vec<RankedMemory>> {
        let layers: &[Layer] = if request.layers.is_empty() {
            &[Layer::Episodic, Layer::Semantic]
        } else {
            &request.layers
        };

        let mut items: Vec<RankedMemory> = Vec::new();

        if layers.contains(&Layer::Episodic) {
            let mut filters = request.filters.clone();
            if let Some(t) = request.at_time {
                filters.until = Some(filters.until.map_or(t, |u| u.min(t)));
            }
            let hits = self
                .episodic
                .recall(query, query_vec, &filters, k)
                .await?;
            for (event, score) in hits {
                items.push(RankedMemory {
                    memory_ref: MemoryRef::event(event.id),
                    layer: Layer::Episodic,
                    score,
                    rationale_tag: tag.to_string(),
                    snippet: event.content,
                    citations: vec![event.id],
                });
            }
        }

        if layers.contains(&Layer::Semantic) {
            let hits = self
                .semantic
                .search(query, query_vec, RetrievalMode::Hybrid, k)
                .await?;
            for (fact, score) in hits {
                let citations = self
                    .semantic
                    .derivation_links(fact.id)
                    .await?
                    .into_iter()
                    .filter(|l| !l.tombstoned)
                    .map(|l| l.event_id)
                    .collect();
                self.semantic.touch(fact.id).await.ok();
                items.push(RankedMemory {
                    memory_ref: MemoryRef::fact(fact.id),
                    layer: Layer::Semantic,
                    score,
                    rationale_tag: tag.to_string(),
                    snippet: fact.content,
                    citations,
                });
            }
        }

        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory_ref.id.cmp(&b.memory_ref.id))
        });
        items.truncate(k);
        Ok(items)
    }
}

// ============================================================================
// TESTS
// ============================================================================
