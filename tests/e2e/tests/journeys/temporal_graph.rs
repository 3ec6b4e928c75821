//! Journey: temporal knowledge graph — time-windowed relations, multi-hop
//! expansion, and community structure.

use athena_core::RelationDraft;
use athena_e2e_tests::harness::TestEngine;
use chrono::{DateTime, Utc};

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid timestamp")
}

#[tokio::test]
async fn collaboration_window_bounds_neighbor_expansion() {
    let harness = TestEngine::new();
    let x = harness
        .engine
        .upsert_entity("X", "person", serde_json::json!({}))
        .await
        .unwrap();
    let y = harness
        .engine
        .upsert_entity("Y", "person", serde_json::json!({}))
        .await
        .unwrap();
    harness
        .engine
        .upsert_relation(RelationDraft {
            src: x.id,
            dst: y.id,
            relation_type: "collaborates".to_string(),
            strength: None,
            valid_from: Some(ts("2024-01-01T00:00:00Z")),
            valid_until: Some(ts("2024-06-01T00:00:00Z")),
            context: None,
        })
        .await
        .unwrap();

    let during = harness
        .engine
        .neighbors(x.id, 1, Some(ts("2024-03-01T00:00:00Z")))
        .await
        .unwrap();
    assert_eq!(during.len(), 1);
    assert_eq!(during[0].entity.id, y.id);
    assert_eq!(during[0].via, "collaborates");

    let after = harness
        .engine
        .neighbors(x.id, 1, Some(ts("2024-09-01T00:00:00Z")))
        .await
        .unwrap();
    assert!(after.is_empty());

    // Untimed queries see the relation regardless of the window.
    let untimed = harness.engine.neighbors(x.id, 1, None).await.unwrap();
    assert_eq!(untimed.len(), 1);
}

#[tokio::test]
async fn invalid_windows_are_rejected() {
    let harness = TestEngine::new();
    let a = harness
        .engine
        .upsert_entity("a", "svc", serde_json::json!({}))
        .await
        .unwrap();
    let b = harness
        .engine
        .upsert_entity("b", "svc", serde_json::json!({}))
        .await
        .unwrap();

    let err = harness
        .engine
        .upsert_relation(RelationDraft {
            src: a.id,
            dst: b.id,
            relation_type: "depends_on".to_string(),
            strength: None,
            valid_from: Some(ts("2024-06-01T00:00:00Z")),
            valid_until: Some(ts("2024-01-01T00:00:00Z")),
            context: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, athena_core::AthenaError::Invalid(_)));
}

#[tokio::test]
async fn closing_a_relation_ends_its_validity() {
    let harness = TestEngine::new();
    let a = harness
        .engine
        .upsert_entity("writer", "svc", serde_json::json!({}))
        .await
        .unwrap();
    let b = harness
        .engine
        .upsert_entity("queue", "svc", serde_json::json!({}))
        .await
        .unwrap();
    let relation = harness
        .engine
        .upsert_relation(RelationDraft {
            src: a.id,
            dst: b.id,
            relation_type: "publishes_to".to_string(),
            strength: Some(0.9),
            valid_from: Some(ts("2024-01-01T00:00:00Z")),
            valid_until: None,
            context: Some("initial topology".to_string()),
        })
        .await
        .unwrap();

    harness
        .engine
        .close_relation(relation.id, ts("2024-04-01T00:00:00Z"))
        .await
        .unwrap();

    let before = harness
        .engine
        .neighbors(a.id, 1, Some(ts("2024-02-01T00:00:00Z")))
        .await
        .unwrap();
    assert_eq!(before.len(), 1);

    let after = harness
        .engine
        .neighbors(a.id, 1, Some(ts("2024-05-01T00:00:00Z")))
        .await
        .unwrap();
    assert!(after.is_empty());
}

#[tokio::test]
async fn communities_follow_relation_density() {
    let harness = TestEngine::new();
    let mut team_a = Vec::new();
    let mut team_b = Vec::new();
    for name in ["a1", "a2", "a3"] {
        team_a.push(
            harness
                .engine
                .upsert_entity(name, "person", serde_json::json!({}))
                .await
                .unwrap()
                .id,
        );
    }
    for name in ["b1", "b2", "b3"] {
        team_b.push(
            harness
                .engine
                .upsert_entity(name, "person", serde_json::json!({}))
                .await
                .unwrap()
                .id,
        );
    }

    let link = |src: i64, dst: i64, strength: f64| {
        let engine = harness.engine.clone();
        async move {
            engine
                .upsert_relation(RelationDraft {
                    src,
                    dst,
                    relation_type: "works_with".to_string(),
                    strength: Some(strength),
                    valid_from: None,
                    valid_until: None,
                    context: None,
                })
                .await
                .unwrap();
        }
    };

    // Dense within teams, one weak bridge between them.
    link(team_a[0], team_a[1], 1.0).await;
    link(team_a[1], team_a[2], 1.0).await;
    link(team_a[0], team_a[2], 1.0).await;
    link(team_b[0], team_b[1], 1.0).await;
    link(team_b[1], team_b[2], 1.0).await;
    link(team_b[0], team_b[2], 1.0).await;
    link(team_a[2], team_b[0], 0.1).await;

    let communities = harness.engine.communities(1.0).await.unwrap();
    assert_eq!(communities.len(), 2);

    let mut expected_a = team_a.clone();
    expected_a.sort_unstable();
    assert!(communities.iter().any(|c| *c == expected_a));
}
