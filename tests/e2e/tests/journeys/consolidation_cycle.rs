//! Journey: dual-process consolidation — accept, reject, and provenance.

use std::time::Duration;

use athena_core::{EngineConfig, EventDraft, FactDraft, MemoryRef};
use athena_e2e_tests::harness::TestEngine;
use athena_e2e_tests::mocks::{clustered_corpus, noise_corpus};

fn consolidation_config(project: &str) -> EngineConfig {
    EngineConfig {
        // Tests cannot wait ten minutes for events to age in.
        min_event_age: Duration::ZERO,
        ..EngineConfig::for_project(project)
    }
}

#[tokio::test]
async fn tight_clusters_are_accepted_with_provenance() {
    let harness = TestEngine::with_config(consolidation_config("e2e-accept"));
    for (content, tags) in clustered_corpus(5, 20) {
        harness
            .engine
            .record_event(EventDraft {
                content,
                tags,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let report = harness.engine.consolidate(Some("balanced"), None).await.unwrap();
    assert_eq!(report.events_in, 100);
    assert!(report.accepted);
    assert!(report.facts_out >= 5, "got {} facts", report.facts_out);
    assert!(report.metrics.recall_estimate >= 0.75);
    assert!(report.metrics.consistency >= 0.8);

    // Every emitted fact traces back to events of this project.
    let stats = harness.engine.stats().await.unwrap();
    assert_eq!(stats.facts as usize, report.facts_out);
}

#[tokio::test]
async fn noise_is_rejected_and_writes_nothing() {
    let harness = TestEngine::with_config(consolidation_config("e2e-reject"));
    for content in noise_corpus(100) {
        harness
            .engine
            .record_event(EventDraft {
                content,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let report = harness.engine.consolidate(Some("quality"), None).await.unwrap();
    assert!(!report.accepted);
    assert_eq!(report.facts_out, 0);

    let stats = harness.engine.stats().await.unwrap();
    assert_eq!(stats.facts, 0);

    // The rejected run still shows up in the audit trail, with metrics.
    let runs = harness.engine.consolidation_stats().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].accepted);
    assert!(runs[0].metrics.recall_estimate < 0.75);
}

#[tokio::test]
async fn zero_eligible_events_is_an_accepted_noop() {
    let harness = TestEngine::with_config(consolidation_config("e2e-noop"));
    let report = harness.engine.consolidate(None, None).await.unwrap();
    assert_eq!(report.events_in, 0);
    assert_eq!(report.facts_out, 0);
    assert!(report.accepted);
    assert!(harness.engine.consolidation_stats().await.unwrap().is_empty());
}

#[tokio::test]
async fn young_events_are_not_eligible() {
    // Default config keeps the ten-minute minimum age.
    let harness = TestEngine::with_config(EngineConfig::for_project("e2e-age"));
    for (content, tags) in clustered_corpus(2, 5) {
        harness
            .engine
            .record_event(EventDraft {
                content,
                tags,
                ..Default::default()
            })
            .await
            .unwrap();
    }
    let report = harness.engine.consolidate(Some("balanced"), None).await.unwrap();
    assert_eq!(report.events_in, 0);
}

#[tokio::test]
async fn soft_delete_tombstones_links_but_keeps_facts() {
    let harness = TestEngine::with_config(consolidation_config("e2e-tombstone"));
    let event = harness
        .engine
        .record_event(EventDraft {
            content: "observed the deploy".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let fact = harness
        .engine
        .store_fact(FactDraft {
            content: "deploys are observed".to_string(),
            derived_from: vec![event.id],
            ..Default::default()
        })
        .await
        .unwrap();

    harness.engine.soft_delete_event(event.id).await.unwrap();

    // The fact survives; its link is tombstoned, not dangling.
    match harness.engine.get(MemoryRef::fact(fact.id)).await.unwrap() {
        athena_core::MemoryItem::Semantic(read) => assert_eq!(read.id, fact.id),
        other => panic!("wrong layer: {other:?}"),
    }
}

#[tokio::test]
async fn derived_from_must_name_existing_events() {
    let harness = TestEngine::new();
    let err = harness
        .engine
        .store_fact(FactDraft {
            content: "orphan".to_string(),
            derived_from: vec![987_654],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, athena_core::AthenaError::NotFound(_)));
}

#[tokio::test]
async fn minimal_profile_reports_without_writing() {
    let harness = TestEngine::with_config(consolidation_config("e2e-minimal"));
    for (content, tags) in clustered_corpus(2, 5) {
        harness
            .engine
            .record_event(EventDraft {
                content,
                tags,
                ..Default::default()
            })
            .await
            .unwrap();
    }
    let report = harness.engine.consolidate(Some("minimal"), None).await.unwrap();
    assert!(report.accepted);
    assert!(report.clusters >= 1);
    assert_eq!(report.facts_out, 0);
    assert_eq!(harness.engine.stats().await.unwrap().facts, 0);
}
