//! Lifecycle events: fan-out channel plus a short in-memory history.
//! Lightweight: one broadcast channel, no persistence.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Number of events kept for `history()`.
const HISTORY_LIMIT: usize = 100;

/// Why an attempt was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Every slot was busy and the overflow policy is `drop`.
    ConcurrencyLimit,
    /// Every slot was busy and the work queue is at capacity.
    QueueFull,
    /// An attempt for the same task is already waiting in the queue.
    AlreadyQueued,
    /// The task is still running its previous invocation.
    AlreadyRunning,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConcurrencyLimit => "concurrency limit reached",
            Self::QueueFull => "work queue full",
            Self::AlreadyQueued => "already queued",
            Self::AlreadyRunning => "already running",
        };
        f.write_str(s)
    }
}

/// Everything the orchestrator reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskStarted {
        task_id: String,
        run_id: String,
        execution_count: u64,
    },
    TaskCompleted {
        task_id: String,
        run_id: String,
        result: serde_json::Value,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: String,
        run_id: String,
        error: String,
        timed_out: bool,
        will_retry: bool,
    },
    TaskQueued {
        task_id: String,
        queued: usize,
    },
    TaskDropped {
        task_id: String,
        reason: DropReason,
    },
    TaskSkipped {
        task_id: String,
    },
    Started,
    Paused,
    Stopped,
    StateRestored {
        restored: usize,
        dropped: usize,
    },
    /// Orchestrator-level failure (persistence); operation continues.
    Error {
        message: String,
    },
}

impl OrchestratorEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskQueued { task_id, .. }
            | Self::TaskDropped { task_id, .. }
            | Self::TaskSkipped { task_id } => Some(task_id),
            _ => None,
        }
    }

    /// Whether this event ends an attempt and changes a runtime record.
    pub fn is_task_outcome(&self) -> bool {
        matches!(self, Self::TaskCompleted { .. } | Self::TaskFailed { .. })
    }
}

/// An event with the time it was emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: OrchestratorEvent,
}

/// Event bus: broadcasts to subscribers and keeps the last 100 events.
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
    history: Mutex<VecDeque<RecordedEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: OrchestratorEvent) {
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(RecordedEvent {
                timestamp: Utc::now(),
                event: event.clone(),
            });
        }
        let _ = self.tx.send(event);
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<RecordedEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(OrchestratorEvent::Started);
        bus.emit(OrchestratorEvent::TaskSkipped {
            task_id: "poll".into(),
        });
        assert_eq!(rx.recv().await.unwrap(), OrchestratorEvent::Started);
        let next = rx.recv().await.unwrap();
        assert_eq!(next.task_id(), Some("poll"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(OrchestratorEvent::Stopped);
        assert_eq!(bus.history().len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::new(4);
        for i in 0..(HISTORY_LIMIT + 20) {
            bus.emit(OrchestratorEvent::TaskSkipped {
                task_id: format!("t{i}"),
            });
        }
        let history = bus.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].event.task_id(), Some("t20"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = OrchestratorEvent::TaskDropped {
            task_id: "sync".into(),
            reason: DropReason::QueueFull,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_dropped");
        assert_eq!(json["reason"], "queue_full");
        assert!(!event.is_task_outcome());
    }
}
