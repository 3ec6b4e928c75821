//! Trigger Evaluation
//!
//! Triggers activate tasks on four clocks:
//! - TIME: the wall-clock ticker (one-shot `at` or recurring `every`)
//! - EVENT: the on-ingest hook, inside the recording transaction
//! - DEPENDENCY / CONTEXT: the on-state-change hook
//! - FILE: a debounced filesystem watcher
//!
//! Every firing activates the trigger's task transactionally with whatever
//! state change caused it. The evaluator is stateless per tick.

use chrono::{DateTime, Utc};
use rusqlite::Transaction;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ProspectiveLayer;
use crate::error::{AthenaError, Result};
use crate::types::MemoryId;

// ============================================================================
// TRIGGER SPECS
// ============================================================================

/// What causes a trigger to fire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fire at a point in time, or on a fixed cadence
    Time {
        /// One-shot firing time
        #[serde(skip_serializing_if = "Option::is_none")]
        at: Option<DateTime<Utc>>,
        /// Recurring cadence in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        every_secs: Option<u64>,
    },
    /// Fire when an ingested event carries a tag matching this pattern
    Event {
        /// Regex matched against each tag
        tag_pattern: String,
    },
    /// Fire when the ambient context description matches this predicate
    Context {
        /// Regex matched against the context string
        predicate: String,
    },
    /// Fire when all listed tasks have completed
    Dependency {
        /// Tasks that must all be complete
        task_ids: Vec<MemoryId>,
    },
    /// Fire when a watched file path matches this glob
    File {
        /// Glob over changed paths (`*`, `?`, `**` supported)
        glob: String,
    },
}

impl TriggerSpec {
    /// Stable kind tag stored in the `kind` column
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerSpec::Time { .. } => "time",
            TriggerSpec::Event { .. } => "event",
            TriggerSpec::Context { .. } => "context",
            TriggerSpec::Dependency { .. } => "dependency",
            TriggerSpec::File { .. } => "file",
        }
    }

    /// Reject specs that could never fire or fail to compile.
    pub fn validate(&self) -> Result<()> {
        match self {
            TriggerSpec::Time { at, every_secs } => {
                if at.is_none() && every_secs.is_none() {
                    return Err(AthenaError::Invalid(
                        "time trigger needs `at` or `every_secs`".to_string(),
                    ));
                }
                if every_secs == &Some(0) {
                    return Err(AthenaError::Invalid(
                        "time trigger cadence must be positive".to_string(),
                    ));
                }
            }
            TriggerSpec::Event { tag_pattern } => {
                regex::Regex::new(tag_pattern)
                    .map_err(|e| AthenaError::Invalid(format!("bad tag pattern: {e}")))?;
            }
            TriggerSpec::Context { predicate } => {
                regex::Regex::new(predicate)
                    .map_err(|e| AthenaError::Invalid(format!("bad context predicate: {e}")))?;
            }
            TriggerSpec::Dependency { task_ids } => {
                if task_ids.is_empty() {
                    return Err(AthenaError::Invalid(
                        "dependency trigger needs at least one task".to_string(),
                    ));
                }
            }
            TriggerSpec::File { glob } => {
                glob_to_regex(glob)
                    .map_err(|e| AthenaError::Invalid(format!("bad glob: {e}")))?;
            }
        }
        Ok(())
    }
}

/// Translate a glob (`*`, `?`, `**`) into an anchored regex.
pub fn glob_to_regex(glob: &str) -> std::result::Result<regex::Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**` crosses directory separators.
                    pattern.push_str(".*");
                    // Swallow a following slash so `a/**/b` matches `a/b`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        pattern.push_str("(?:/)?");
                    }
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            '?' => pattern.push_str("[^/]"),
            c if "\\.^$|()[]{}+".contains(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    regex::Regex::new(&pattern)
}

// ============================================================================
// EVALUATOR
// ============================================================================

/// Stateless trigger evaluation, one associated function per clock
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    /// TIME clock: fire due time triggers. Called from the ticker.
    pub async fn tick_time(layer: &ProspectiveLayer) -> Result<usize> {
        let layer = layer.clone();
        layer
            .store()
            .clone()
            .transaction(move |tx| Self::tick_time_in_tx(&layer, tx, Utc::now()))
            .await
    }

    pub(crate) fn tick_time_in_tx(
        layer: &ProspectiveLayer,
        tx: &Transaction<'_>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let triggers = layer.triggers_of_kind_in_conn(tx, "time")?;
        let mut fired = 0;
        for trigger in triggers {
            let due = match &trigger.spec {
                TriggerSpec::Time { at, every_secs } => {
                    let one_shot_due =
                        at.map(|t| t <= now && trigger.last_fired.is_none()).unwrap_or(false);
                    let recurring_due = every_secs
                        .map(|secs| match trigger.last_fired {
                            None => true,
                            Some(last) => {
                                now - last >= chrono::Duration::seconds(secs.max(1) as i64)
                            }
                        })
                        .unwrap_or(false);
                    one_shot_due || recurring_due
                }
                _ => false,
            };
            if due && layer.fire_in_tx(tx, &trigger)? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// EVENT hook: fire tag-pattern triggers inside the transaction that
    /// records the event.
    pub(crate) fn fire_event_in_tx(
        layer: &ProspectiveLayer,
        tx: &Transaction<'_>,
        tags: &[String],
    ) -> Result<usize> {
        let triggers = layer.triggers_of_kind_in_conn(tx, "event")?;
        let mut fired = 0;
        for trigger in triggers {
            let TriggerSpec::Event { tag_pattern } = &trigger.spec else {
                continue;
            };
            let Ok(pattern) = regex::Regex::new(tag_pattern) else {
                continue; // validated at creation; stale rows just skip
            };
            if tags.iter().any(|t| pattern.is_match(t)) && layer.fire_in_tx(tx, &trigger)? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// DEPENDENCY hook: fire triggers whose task list is now fully
    /// complete, inside the transaction that completed `completed_id`.
    pub(crate) fn fire_dependency_in_tx(
        layer: &ProspectiveLayer,
        tx: &Transaction<'_>,
        completed_id: MemoryId,
    ) -> Result<usize> {
        let triggers = layer.triggers_of_kind_in_conn(tx, "dependency")?;
        let mut fired = 0;
        for trigger in triggers {
            let TriggerSpec::Dependency { task_ids } = &trigger.spec else {
                continue;
            };
            if !task_ids.contains(&completed_id) {
                continue;
            }
            let mut all_done = true;
            for task_id in task_ids {
                let status: Option<String> = tx
                    .query_row(
                        "SELECT status FROM tasks WHERE id = ?1",
                        rusqlite::params![task_id],
                        |row| row.get(0),
                    )
                    .ok();
                if status.as_deref() != Some("completed") {
                    all_done = false;
                    break;
                }
            }
            if all_done && layer.fire_in_tx(tx, &trigger)? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// CONTEXT hook: fire predicate triggers against the current context
    /// description. Called on state changes and from the ticker.
    pub async fn fire_context(layer: &ProspectiveLayer, context: &str) -> Result<usize> {
        let layer = layer.clone();
        let context = context.to_string();
        layer
            .store()
            .clone()
            .transaction(move |tx| {
                let triggers = layer.triggers_of_kind_in_conn(tx, "context")?;
                let mut fired = 0;
                for trigger in triggers {
                    let TriggerSpec::Context { predicate } = &trigger.spec else {
                        continue;
                    };
                    let Ok(pattern) = regex::Regex::new(predicate) else {
                        continue;
                    };
                    if pattern.is_match(&context) && layer.fire_in_tx(tx, &trigger)? {
                        fired += 1;
                    }
                }
                Ok(fired)
            })
            .await
    }

    /// FILE clock: fire glob triggers for a debounced batch of changed
    /// paths.
    pub async fn fire_file_changes(layer: &ProspectiveLayer, paths: &[PathBuf]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let layer = layer.clone();
        let paths: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        layer
            .store()
            .clone()
            .transaction(move |tx| {
                let triggers = layer.triggers_of_kind_in_conn(tx, "file")?;
                let mut fired = 0;
                for trigger in triggers {
                    let TriggerSpec::File { glob } = &trigger.spec else {
                        continue;
                    };
                    let Ok(pattern) = glob_to_regex(glob) else {
                        continue;
                    };
                    let hit = paths.iter().any(|p| pattern.is_match(p));
                    if hit && layer.fire_in_tx(tx, &trigger)? {
                        fired += 1;
                    }
                }
                Ok(fired)
            })
            .await
    }

    /// Spawn the debounced filesystem watcher for FILE triggers.
    ///
    /// Returns the join handle; dropping the returned watcher stops event
    /// delivery, and the task exits when the channel closes.
    pub fn spawn_file_watcher(
        layer: ProspectiveLayer,
        root: &Path,
        debounce: Duration,
    ) -> Result<(notify::RecommendedWatcher, tokio::task::JoinHandle<()>)> {
        use notify::Watcher;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        })
        .map_err(|e| AthenaError::Invalid(format!("watcher init: {e}")))?;

        watcher
            .watch(root, notify::RecursiveMode::Recursive)
            .map_err(|e| AthenaError::Invalid(format!("watch {root:?}: {e}")))?;

        let handle = tokio::spawn(async move {
            loop {
                let Some(first) = rx.recv().await else { break };
                let mut batch = vec![first];
                // Debounce: keep draining until the window goes quiet.
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(path)) => batch.push(path),
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
                batch.sort();
                batch.dedup();
                if let Err(err) = Self::fire_file_changes(&layer, &batch).await {
                    tracing::warn!("file trigger sweep failed: {err}");
                }
            }
        });

        Ok((watcher, handle))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::prospective::{TaskDraft, TaskStatus};
    use crate::store::Store;
    use std::sync::Arc;

    fn layer() -> (tempfile::TempDir, ProspectiveLayer) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig::for_project("trigger-tests"));
        let store = Store::open(Some(dir.path().join("athena.db")), &config).unwrap();
        (dir, ProspectiveLayer::new(store, config))
    }

    async fn task(layer: &ProspectiveLayer, title: &str) -> crate::prospective::Task {
        let cloned = layer.clone();
        let draft = TaskDraft {
            title: title.to_string(),
            ..Default::default()
        };
        layer
            .store()
            .clone()
            .transaction(move |tx| cloned.create_in_tx(tx, &draft))
            .await
            .unwrap()
    }

    #[test]
    fn test_spec_validation() {
        assert!(TriggerSpec::Time {
            at: None,
            every_secs: None
        }
        .validate()
        .is_err());
        assert!(TriggerSpec::Event {
            tag_pattern: "(".to_string()
        }
        .validate()
        .is_err());
        assert!(TriggerSpec::Dependency { task_ids: vec![] }.validate().is_err());
        assert!(TriggerSpec::File {
            glob: "src/**/*.rs".to_string()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("src/**/*.rs").unwrap();
        assert!(re.is_match("src/lib.rs"));
        assert!(re.is_match("src/store/pool.rs"));
        assert!(!re.is_match("tests/lib.rs"));
        assert!(!re.is_match("src/lib.rs.bak"));

        let single = glob_to_regex("*.toml").unwrap();
        assert!(single.is_match("Cargo.toml"));
        assert!(!single.is_match("config/Cargo.toml"));
    }

    #[tokio::test]
    async fn test_time_trigger_one_shot_fires_once() {
        let (_dir, layer) = layer();
        let target = task(&layer, "timed").await;
        layer
            .create_trigger(
                TriggerSpec::Time {
                    at: Some(Utc::now() - chrono::Duration::seconds(5)),
                    every_secs: None,
                },
                target.id,
            )
            .await
            .unwrap();

        assert_eq!(TriggerEvaluator::tick_time(&layer).await.unwrap(), 1);
        let promoted = layer.get(target.id).await.unwrap().unwrap();
        assert_eq!(promoted.status, TaskStatus::Ready);

        // One-shot: a second tick does not fire again.
        assert_eq!(TriggerEvaluator::tick_time(&layer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_event_trigger_matches_tags() {
        let (_dir, layer) = layer();
        let target = task(&layer, "on deploy").await;
        layer
            .create_trigger(
                TriggerSpec::Event {
                    tag_pattern: "^deploy$".to_string(),
                },
                target.id,
            )
            .await
            .unwrap();

        let l = layer.clone();
        let fired = layer
            .store()
            .clone()
            .transaction(move |tx| {
                TriggerEvaluator::fire_event_in_tx(&l, tx, &["deploy".to_string()])
            })
            .await
            .unwrap();
        assert_eq!(fired, 1);
        assert_eq!(
            layer.get(target.id).await.unwrap().unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_dependency_trigger_waits_for_all() {
        let (_dir, layer) = layer();
        let a = task(&layer, "dep a").await;
        let b = task(&layer, "dep b").await;
        let target = task(&layer, "after both").await;
        layer
            .create_trigger(
                TriggerSpec::Dependency {
                    task_ids: vec![a.id, b.id],
                },
                target.id,
            )
            .await
            .unwrap();

        layer.claim(a.id, "agent").await.unwrap();
        layer
            .update_status(a.id, TaskStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(
            layer.get(target.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        layer.claim(b.id, "agent").await.unwrap();
        layer
            .update_status(b.id, TaskStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(
            layer.get(target.id).await.unwrap().unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_context_trigger() {
        let (_dir, layer) = layer();
        let target = task(&layer, "while debugging payments").await;
        layer
            .create_trigger(
                TriggerSpec::Context {
                    predicate: "payments".to_string(),
                },
                target.id,
            )
            .await
            .unwrap();

        assert_eq!(
            TriggerEvaluator::fire_context(&layer, "editing billing code").await.unwrap(),
            0
        );
        assert_eq!(
            TriggerEvaluator::fire_context(&layer, "debugging payments module").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_file_trigger_glob() {
        let (_dir, layer) = layer();
        let target = task(&layer, "on config change").await;
        layer
            .create_trigger(
                TriggerSpec::File {
                    glob: "**/*.toml".to_string(),
                },
                target.id,
            )
            .await
            .unwrap();

        let fired = TriggerEvaluator::fire_file_changes(
            &layer,
            &[PathBuf::from("/repo/config/settings.toml")],
        )
        .await
        .unwrap();
        assert_eq!(fired, 1);
    }
}
