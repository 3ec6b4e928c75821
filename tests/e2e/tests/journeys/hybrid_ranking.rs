//! Journey: hybrid ranking respects the vector/lexical blend, stays
//! deterministic, and degrades cleanly without embeddings.

use std::sync::Arc;

use athena_core::{EngineConfig, FactDraft, Layer, RetrievalRequest, Strategy};
use athena_e2e_tests::harness::TestEngine;
use athena_e2e_tests::mocks::ScriptedEmbedder;

const DIM: usize = 8;
const QUERY: &str = "vector database comparison";
// Strong lexical match for the query, scripted to be orthogonal in
// vector space.
const F1: &str = "a comparison guide for vector database options";
// Weak lexical match, scripted to sit next to the query vector.
const F2: &str = "notes on pgvector and qdrant tradeoffs";

fn basis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i] = 1.0;
    v
}

fn scripted() -> Arc<ScriptedEmbedder> {
    let embedder = Arc::new(ScriptedEmbedder::new(DIM));
    embedder.assign(F1, basis(1));
    embedder.assign(F2, basis(2));
    embedder.assign(QUERY, basis(2)); // query lands on F2's direction
    embedder
}

fn config(project: &str, alpha: f64) -> EngineConfig {
    EngineConfig {
        embedding_dim: DIM,
        hybrid_alpha: alpha,
        ..EngineConfig::for_project(project)
    }
}

async fn store_both(harness: &TestEngine) -> (i64, i64) {
    let f1 = harness
        .engine
        .store_fact(FactDraft {
            content: F1.to_string(),
            topics: vec!["vector dbs".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    let f2 = harness
        .engine
        .store_fact(FactDraft {
            content: F2.to_string(),
            topics: vec!["vector dbs".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    (f1.id, f2.id)
}

#[tokio::test]
async fn alpha_high_prefers_vector_similarity() {
    let harness = TestEngine::with_embedder(config("e2e-alpha-high", 0.7), scripted());
    let (f1, f2) = store_both(&harness).await;

    let response = harness
        .engine
        .query(RetrievalRequest {
            query_text: QUERY.to_string(),
            layers: vec![Layer::Semantic],
            ..Default::default()
        })
        .await
        .unwrap();

    let order: Vec<i64> = response.items.iter().map(|i| i.memory_ref.id).collect();
    assert_eq!(order.first(), Some(&f2));
    assert!(order.contains(&f1));
}

#[tokio::test]
async fn alpha_zero_prefers_lexical_match() {
    let harness = TestEngine::with_embedder(config("e2e-alpha-zero", 0.0), scripted());
    let (f1, _f2) = store_both(&harness).await;

    let response = harness
        .engine
        .query(RetrievalRequest {
            query_text: QUERY.to_string(),
            layers: vec![Layer::Semantic],
            ..Default::default()
        })
        .await
        .unwrap();

    let order: Vec<i64> = response.items.iter().map(|i| i.memory_ref.id).collect();
    assert_eq!(order.first(), Some(&f1));
}

#[tokio::test]
async fn identical_inputs_rank_identically() {
    let harness = TestEngine::with_embedder(config("e2e-determinism", 0.7), scripted());
    store_both(&harness).await;

    let request = RetrievalRequest {
        query_text: QUERY.to_string(),
        layers: vec![Layer::Semantic],
        ..Default::default()
    };
    let first: Vec<i64> = harness
        .engine
        .query(request.clone())
        .await
        .unwrap()
        .items
        .iter()
        .map(|i| i.memory_ref.id)
        .collect();
    for _ in 0..5 {
        let again: Vec<i64> = harness
            .engine
            .query(request.clone())
            .await
            .unwrap()
            .items
            .iter()
            .map(|i| i.memory_ref.id)
            .collect();
        assert_eq!(first, again);
    }
}

#[tokio::test]
async fn hyde_without_embeddings_falls_back_and_flags_degraded() {
    let harness = TestEngine::lexical_only(EngineConfig::for_project("e2e-degraded"));
    harness
        .engine
        .store_fact(FactDraft {
            content: "incident retro covering the cache outage".to_string(),
            topics: vec!["incident".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

    let response = harness
        .engine
        .query(RetrievalRequest {
            query_text: "cache outage retro".to_string(),
            layers: vec![Layer::Semantic],
            strategy: Some(Strategy::Hyde),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(response.degraded);
    assert_eq!(response.items.len(), 1);

    // The stored row carries the degraded flag too.
    match harness
        .engine
        .get(athena_core::MemoryRef::fact(response.items[0].memory_ref.id))
        .await
        .unwrap()
    {
        athena_core::MemoryItem::Semantic(fact) => {
            assert!(fact.degraded);
            assert!(!fact.has_embedding);
        }
        other => panic!("wrong layer: {other:?}"),
    }
}

#[tokio::test]
async fn k_one_returns_the_blend_winner() {
    let harness = TestEngine::with_embedder(config("e2e-top1", 0.7), scripted());
    let (_f1, f2) = store_both(&harness).await;

    let response = harness
        .engine
        .query(RetrievalRequest {
            query_text: QUERY.to_string(),
            layers: vec![Layer::Semantic],
            k: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.items.len(), 1);
    assert_eq!(response.items[0].memory_ref.id, f2);
}
