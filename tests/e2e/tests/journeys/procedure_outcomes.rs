//! Journey: register procedures, record outcomes, verify the running mean.

use athena_core::{ProcedureDraft, ProcedureStep};
use athena_e2e_tests::harness::TestEngine;

fn rollback_draft() -> ProcedureDraft {
    ProcedureDraft {
        name: "rollback".to_string(),
        description: "undo a bad deploy".to_string(),
        steps: vec![
            ProcedureStep {
                action: "pause the deploy pipeline".to_string(),
                expected: None,
            },
            ProcedureStep {
                action: "restore the previous release".to_string(),
                expected: Some("previous version serving".to_string()),
            },
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn outcome_sequence_follows_the_running_mean() {
    let harness = TestEngine::new();
    let p = harness.engine.upsert_procedure(rollback_draft()).await.unwrap();
    assert!((p.success_rate - 0.5).abs() < 1e-9);
    assert_eq!(p.usage_count, 0);

    // First outcome: (0.5 * 0 + 1) / 1 = 1.0
    let p1 = harness
        .engine
        .record_procedure_outcome(p.id, true)
        .await
        .unwrap();
    assert!((p1.success_rate - 1.0).abs() < 1e-9);
    assert_eq!(p1.usage_count, 1);

    // Second outcome: (1.0 * 1 + 0) / 2 = 0.5
    let p2 = harness
        .engine
        .record_procedure_outcome(p.id, false)
        .await
        .unwrap();
    assert!((p2.success_rate - 0.5).abs() < 1e-9);
    assert_eq!(p2.usage_count, 2);
}

#[tokio::test]
async fn closed_form_over_a_long_sequence() {
    let harness = TestEngine::new();
    let p = harness.engine.upsert_procedure(rollback_draft()).await.unwrap();
    let r0 = p.success_rate;
    let c0 = p.usage_count as f64;

    let outcomes: Vec<bool> = (0..25).map(|i| i % 3 != 0).collect();
    let mut latest = p.clone();
    for &s in &outcomes {
        latest = harness
            .engine
            .record_procedure_outcome(p.id, s)
            .await
            .unwrap();
        // Bounds hold at every step.
        assert!((0.0..=1.0).contains(&latest.success_rate));
    }

    let successes = outcomes.iter().filter(|s| **s).count() as f64;
    let expected = (r0 * c0 + successes) / (c0 + outcomes.len() as f64);
    assert!((latest.success_rate - expected).abs() < 1e-9);
    assert_eq!(latest.usage_count, outcomes.len() as i64);
}

#[tokio::test]
async fn search_prefers_successful_procedures_on_ties() {
    let harness = TestEngine::new();
    let risky = harness
        .engine
        .upsert_procedure(ProcedureDraft {
            name: "deploy fast".to_string(),
            description: "deploy without canary".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let safe = harness
        .engine
        .upsert_procedure(ProcedureDraft {
            name: "deploy canary".to_string(),
            description: "deploy with canary".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    harness
        .engine
        .record_procedure_outcome(risky.id, false)
        .await
        .unwrap();
    harness
        .engine
        .record_procedure_outcome(safe.id, true)
        .await
        .unwrap();

    let hits = harness.engine.search_procedures("deploy", 5).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0.id, safe.id);
}

#[tokio::test]
async fn statistics_aggregate() {
    let harness = TestEngine::new();
    let p = harness.engine.upsert_procedure(rollback_draft()).await.unwrap();
    harness
        .engine
        .record_procedure_outcome(p.id, true)
        .await
        .unwrap();

    let stats = harness.engine.procedure_statistics().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.total_outcomes, 1);
}
