//! Engine Event Stream
//!
//! A typed broadcast channel external orchestration can subscribe to.
//! Publishing is fire-and-forget and never consulted on the write path:
//! a full or receiver-less channel drops notifications, it does not block
//! or fail the write that produced them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{MemoryId, MemoryRef};

/// Buffered notifications per subscriber before lagging drops the oldest
const CHANNEL_CAPACITY: usize = 256;

/// Notifications emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryEvent {
    /// An event row was durably recorded
    EventRecorded {
        /// The new event
        event_id: MemoryId,
        /// Its session, when present
        session_id: Option<String>,
    },
    /// A task reached `completed`
    TaskCompleted {
        /// The finished task
        task_id: MemoryId,
    },
    /// The reaper reset a task whose owner went silent
    TaskPreempted {
        /// The reset task
        task_id: MemoryId,
    },
    /// A consolidation run finished (accepted or not)
    ConsolidationFinished {
        /// Run identifier
        run_id: String,
        /// Whether its output was committed
        accepted: bool,
    },
    /// Working memory is nearly full (advisory)
    Pressure {
        /// Current load in [0,1]
        load: f64,
    },
    /// A write continued without an embedding
    Degraded {
        /// The affected row
        memory_ref: MemoryRef,
    },
}

/// Broadcast hub for [`MemoryEvent`]
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MemoryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe; each receiver sees every event from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Publish, dropping the event when nobody listens
    pub fn publish(&self, event: MemoryEvent) {
        let _ = self.sender.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(MemoryEvent::TaskCompleted { task_id: 7 });
        match rx.recv().await.unwrap() {
            MemoryEvent::TaskCompleted { task_id } => assert_eq!(task_id, 7),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(MemoryEvent::Pressure { load: 0.95 });
    }

    #[test]
    fn test_events_serialize_with_kind_tag() {
        let json = serde_json::to_string(&MemoryEvent::Pressure { load: 1.0 }).unwrap();
        assert!(json.contains("\"kind\":\"pressure\""));
    }
}
