//! Pool lifecycle events.
//!
//! Events are published while the pool lock is held, so every subscriber
//! sees them in the same total order.

use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

use docket_core::{TaskId, WorkerId, WorkerType};

use crate::executor::ExecutionError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkerStarted {
        worker_id: WorkerId,
        worker_type: WorkerType,
    },
    WorkerStopped {
        worker_id: WorkerId,
        worker_type: WorkerType,
    },
    WorkerRestarted {
        old_worker_id: WorkerId,
        new_worker_id: WorkerId,
        worker_type: WorkerType,
        reason: String,
    },
    TaskQueued {
        task_id: TaskId,
        task_type: String,
        position: usize,
    },
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
        /// 1 for the first attempt.
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        output: serde_json::Value,
        duration_ms: u64,
    },
    TaskRetryScheduled {
        task_id: TaskId,
        #[serde(serialize_with = "display")]
        error: ExecutionError,
        /// Retry number, 1-based.
        attempt: u32,
        delay_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        #[serde(serialize_with = "display")]
        error: ExecutionError,
        /// Failed attempts made before giving up.
        attempts: u32,
    },
    PoolScaled {
        from: u32,
        to: u32,
        reason: String,
    },
}

impl PoolEvent {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            PoolEvent::TaskQueued { task_id, .. }
            | PoolEvent::TaskAssigned { task_id, .. }
            | PoolEvent::TaskCompleted { task_id, .. }
            | PoolEvent::TaskRetryScheduled { task_id, .. }
            | PoolEvent::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Whether this is the last event a task will ever produce.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PoolEvent::TaskCompleted { .. } | PoolEvent::TaskFailed { .. }
        )
    }
}

fn display<S: Serializer>(error: &ExecutionError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Fan-out to every live subscriber. Closed receivers are dropped on the
/// next publish.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<PoolEvent>>,
}

impl EventBus {
    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, event: PoolEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_subscriber_receives_events_in_order() {
        let mut bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(PoolEvent::PoolScaled { from: 2, to: 3, reason: "load".into() });
        bus.publish(PoolEvent::PoolScaled { from: 3, to: 4, reason: "load".into() });

        for rx in [&mut a, &mut b] {
            assert!(matches!(rx.try_recv().unwrap(), PoolEvent::PoolScaled { to: 3, .. }));
            assert!(matches!(rx.try_recv().unwrap(), PoolEvent::PoolScaled { to: 4, .. }));
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut bus = EventBus::default();
        let rx = bus.subscribe();
        let _keep = bus.subscribe();
        drop(rx);

        bus.publish(PoolEvent::PoolScaled { from: 1, to: 2, reason: "manual".into() });
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn failed_event_serializes_error_as_text() {
        let event = PoolEvent::TaskFailed {
            task_id: TaskId::from("t1"),
            error: ExecutionError::failed("corrupt pdf"),
            attempts: 4,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "event": "task_failed", "task_id": "t1", "error": "corrupt pdf", "attempts": 4 })
        );
        assert!(event.is_terminal());
        assert_eq!(event.task_id(), Some(&TaskId::from("t1")));
    }

    #[test]
    fn worker_events_have_no_task() {
        let event = PoolEvent::WorkerStarted {
            worker_id: WorkerId::new(WorkerType::SearchIndexer, 1),
            worker_type: WorkerType::SearchIndexer,
        };
        assert!(event.task_id().is_none());
        assert!(!event.is_terminal());
    }
}
