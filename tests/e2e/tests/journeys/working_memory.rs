//! Journey: working-memory projection stays bounded and usefulness
//! feedback accumulates as specified.

use athena_core::{EngineConfig, EventDraft, MemoryRef, RetrievalRequest};
use athena_e2e_tests::harness::TestEngine;

#[tokio::test]
async fn projection_never_exceeds_the_limit() {
    let harness = TestEngine::with_config(EngineConfig {
        working_memory_limit: 4,
        ..EngineConfig::for_project("e2e-wm")
    });

    for i in 0..12 {
        harness
            .engine
            .record_event(EventDraft {
                content: format!("observation {i}"),
                importance: Some(0.1 + (i as f64) * 0.05),
                ..Default::default()
            })
            .await
            .unwrap();
        // The bound holds at every observable instant, not just the end.
        assert!(harness.engine.working_memory().len() <= 4);
    }

    let working = harness.engine.working_memory();
    assert_eq!(working.len(), 4);
    for pair in working.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!((harness.engine.cognitive_load() - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn mark_useful_accumulates_and_converges() {
    let harness = TestEngine::new();
    let event = harness
        .engine
        .record_event(EventDraft {
            content: "frequently useful memory".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let memory_ref = MemoryRef::event(event.id);

    let n = 30;
    for _ in 0..n {
        harness.engine.mark_useful(memory_ref, true).await.unwrap();
    }

    let quality = harness.engine.quality(memory_ref).await.unwrap().unwrap();
    assert_eq!(quality.useful_count, n);
    assert_eq!(quality.access_count, n);
    assert!(quality.usefulness_score > 0.95);
    assert!(quality.usefulness_score <= 1.0);
}

#[tokio::test]
async fn queries_count_as_accesses() {
    let harness = TestEngine::new();
    let event = harness
        .engine
        .record_event(EventDraft {
            content: "query target about deploy windows".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    harness
        .engine
        .query(RetrievalRequest {
            query_text: "deploy windows".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let quality = harness
        .engine
        .quality(MemoryRef::event(event.id))
        .await
        .unwrap()
        .unwrap();
    assert!(quality.access_count >= 1);
}

#[tokio::test]
async fn domain_evidence_climbs_the_ladder() {
    let harness = TestEngine::new();
    for _ in 0..20 {
        harness
            .engine
            .record_domain_evidence("observability")
            .await
            .unwrap();
    }
    let coverage = harness.engine.domain_coverage().await.unwrap();
    assert_eq!(coverage.len(), 1);
    assert_eq!(coverage[0].evidence_count, 20);
    assert_eq!(coverage[0].expertise, athena_core::Expertise::Advanced);
}
