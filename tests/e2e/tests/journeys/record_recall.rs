//! Journey: record events, recall them by session, time, and query.

use athena_core::{EventDraft, EventFilter, RetrievalRequest};
use athena_e2e_tests::harness::TestEngine;

fn draft(content: &str, tags: &[&str], importance: f64, session: &str) -> EventDraft {
    EventDraft {
        content: content.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        importance: Some(importance),
        session_id: Some(session.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn record_then_recall_by_session_is_chronological() {
    let harness = TestEngine::new();
    let e1 = harness
        .engine
        .record_event(draft(
            "deployed service A at 10:00",
            &["deploy", "A"],
            0.6,
            "sess1",
        ))
        .await
        .unwrap();
    let e2 = harness
        .engine
        .record_event(draft(
            "rollback of service A at 10:30",
            &["rollback", "A"],
            0.9,
            "sess1",
        ))
        .await
        .unwrap();

    let timeline = harness.engine.timeline_session("sess1").await.unwrap();
    let ids: Vec<i64> = timeline.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![e1.id, e2.id]);
    assert_eq!(timeline[0].content, "deployed service A at 10:00");
    assert_eq!(timeline[1].content, "rollback of service A at 10:30");

    // Tags were normalized on write.
    assert_eq!(timeline[0].tags, vec!["a", "deploy"]);
    assert!((timeline[1].importance - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn recall_by_time_uses_half_open_range() {
    let harness = TestEngine::new();
    let before = chrono::Utc::now();
    harness.seed_events(3, "timed").await;
    let after = chrono::Utc::now();

    let all = harness.engine.timeline_range(before, after).await.unwrap();
    assert_eq!(all.len(), 3);

    let none = harness.engine.timeline_range(after, after).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn empty_query_returns_empty_ranked_list() {
    let harness = TestEngine::new();
    harness.seed_events(2, "s").await;
    let response = harness
        .engine
        .query(RetrievalRequest {
            query_text: "   ".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(response.items.is_empty());
}

#[tokio::test]
async fn k_zero_and_k_beyond_available() {
    let harness = TestEngine::new();
    harness.seed_events(4, "s").await;

    let zero = harness
        .engine
        .recall_events("seeded observation", &EventFilter::default(), 0)
        .await
        .unwrap();
    assert!(zero.is_empty());

    let exact = harness
        .engine
        .recall_events("seeded observation", &EventFilter::default(), 4)
        .await
        .unwrap();
    let beyond = harness
        .engine
        .recall_events("seeded observation", &EventFilter::default(), 50)
        .await
        .unwrap();
    assert_eq!(exact.len(), 4);
    assert_eq!(beyond.len(), 4);
    let exact_ids: Vec<i64> = exact.iter().map(|(e, _)| e.id).collect();
    let beyond_ids: Vec<i64> = beyond.iter().map(|(e, _)| e.id).collect();
    assert_eq!(exact_ids, beyond_ids);
}

#[tokio::test]
async fn soft_deleted_events_leave_the_timeline() {
    let harness = TestEngine::new();
    let ids = harness.seed_events(3, "wipe").await;
    harness.engine.soft_delete_event(ids[1]).await.unwrap();

    let timeline = harness.engine.timeline_session("wipe").await.unwrap();
    assert_eq!(timeline.len(), 2);
    assert!(timeline.iter().all(|e| e.id != ids[1]));

    // The row itself survives as a tombstone.
    let raw = harness.engine.get_event(ids[1]).await.unwrap().unwrap();
    assert!(raw.tombstone);
}

#[tokio::test]
async fn corrections_reference_the_corrected_event() {
    let harness = TestEngine::new();
    let original = harness
        .engine
        .record_event(draft("deploy finished at 10:00", &["deploy"], 0.5, "fix"))
        .await
        .unwrap();
    let correction = harness
        .engine
        .record_event(EventDraft {
            content: "deploy actually finished at 10:05".to_string(),
            tags: vec!["deploy".to_string(), format!("corrects:{}", original.id)],
            session_id: Some("fix".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let timeline = harness.engine.timeline_session("fix").await.unwrap();
    assert_eq!(timeline.len(), 2);
    assert!(correction
        .tags
        .iter()
        .any(|t| t == &format!("corrects:{}", original.id)));
}
