//! Journey: task lifecycle, exclusive claiming, and stale-owner preemption.

use std::time::Duration;

use athena_core::{
    AthenaError, EngineConfig, MemoryEvent, TaskDraft, TaskStatus,
};
use athena_e2e_tests::harness::TestEngine;

fn task(title: &str) -> TaskDraft {
    TaskDraft {
        title: title.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let harness = TestEngine::new();
    let t = harness.engine.create_task(task("contested")).await.unwrap();

    let engine_a = harness.engine.clone();
    let engine_b = harness.engine.clone();
    let (a, b) = tokio::join!(
        engine_a.claim_task(t.id, "agent-a"),
        engine_b.claim_task(t.id, "agent-b"),
    );

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser.unwrap_err(), AthenaError::AlreadyClaimed(_)));

    let after = harness.engine.get_task(t.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::InProgress);
    assert!(after.owner_agent_id.is_some());
    assert_eq!(after.claim_version, 1);
}

#[tokio::test]
async fn status_updates_are_idempotent_and_fsm_checked() {
    let harness = TestEngine::new();
    let t = harness.engine.create_task(task("lifecycle")).await.unwrap();

    // pending -> completed skips the machine.
    let err = harness
        .engine
        .update_task_status(t.id, TaskStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AthenaError::Invalid(_)));

    assert!(harness.engine.claim_task(t.id, "agent").await.unwrap());
    let done = harness
        .engine
        .update_task_status(t.id, TaskStatus::Completed, Some("shipped".to_string()))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.owner_agent_id.is_none());

    // Applying the same terminal status twice is a no-op, not an error.
    let again = harness
        .engine
        .update_task_status(t.id, TaskStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(again.status, TaskStatus::Completed);
    assert_eq!(again.result.as_deref(), Some("shipped"));
}

#[tokio::test]
async fn dependent_tasks_become_ready_when_dependencies_complete() {
    let harness = TestEngine::new();
    let dep = harness.engine.create_task(task("first")).await.unwrap();
    let dependent = harness
        .engine
        .create_task(TaskDraft {
            title: "second".to_string(),
            depends_on: vec![dep.id],
            ..Default::default()
        })
        .await
        .unwrap();

    // Not claimable while the dependency is open.
    assert!(harness
        .engine
        .claim_task(dependent.id, "agent")
        .await
        .is_err());

    assert!(harness.engine.claim_task(dep.id, "agent").await.unwrap());
    harness
        .engine
        .update_task_status(dep.id, TaskStatus::Completed, None)
        .await
        .unwrap();

    let promoted = harness.engine.get_task(dependent.id).await.unwrap().unwrap();
    assert_eq!(promoted.status, TaskStatus::Ready);
    assert!(harness
        .engine
        .claim_task(dependent.id, "agent")
        .await
        .unwrap());
}

#[tokio::test]
async fn stale_owner_is_preempted_by_the_reaper() {
    let harness = TestEngine::with_config(EngineConfig {
        stale_heartbeat: Duration::from_millis(50),
        heartbeat_tick: Duration::from_millis(40),
        ..EngineConfig::for_project("e2e-reaper")
    });
    let t = harness.engine.create_task(task("abandoned")).await.unwrap();
    assert!(harness
        .engine
        .claim_task(t.id, "vanishing-agent")
        .await
        .unwrap());
    let claimed = harness.engine.get_task(t.id).await.unwrap().unwrap();
    assert_eq!(claimed.claim_version, 1);

    let mut rx = harness.engine.subscribe();
    let _workers = harness.engine.spawn_workers();

    // The owner never heartbeats again; the reaper resets the task.
    let preempted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MemoryEvent::TaskPreempted { task_id }) = rx.recv().await {
                break task_id;
            }
        }
    })
    .await
    .expect("preemption within the timeout");
    assert_eq!(preempted, t.id);

    let reset = harness.engine.get_task(t.id).await.unwrap().unwrap();
    assert_eq!(reset.status, TaskStatus::Ready);
    assert!(reset.owner_agent_id.is_none());
    assert_eq!(reset.claim_version, 2);

    // Replay is at-least-once: another agent can pick it back up.
    assert!(harness.engine.claim_task(t.id, "agent-b").await.unwrap());
}

#[tokio::test]
async fn heartbeats_keep_a_task_owned() {
    let harness = TestEngine::with_config(EngineConfig {
        stale_heartbeat: Duration::from_millis(400),
        heartbeat_tick: Duration::from_millis(40),
        ..EngineConfig::for_project("e2e-heartbeat")
    });
    let t = harness.engine.create_task(task("alive")).await.unwrap();
    assert!(harness.engine.claim_task(t.id, "diligent").await.unwrap());
    let _workers = harness.engine.spawn_workers();

    // Keep heartbeating for a while; the reaper must leave us alone.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(80)).await;
        harness.engine.heartbeat("diligent").await.unwrap();
    }
    let still = harness.engine.get_task(t.id).await.unwrap().unwrap();
    assert_eq!(still.status, TaskStatus::InProgress);
    assert_eq!(still.owner_agent_id.as_deref(), Some("diligent"));
}
