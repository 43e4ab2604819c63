//! FIFO queue of tasks waiting for a worker.
//!
//! Retries sit in the same queue with a `ready_at` in the future; they keep
//! their place but are skipped until the backoff has elapsed.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use docket_core::{Task, TaskId};

#[derive(Debug, Clone)]
pub(crate) struct QueuedTask {
    pub task: Task,
    pub enqueued_at: Instant,
    pub ready_at: Instant,
}

impl QueuedTask {
    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at <= now
    }
}

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    entries: VecDeque<QueuedTask>,
}

impl TaskQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a task; returns its 0-based position.
    pub fn push_back(&mut self, task: Task, now: Instant, ready_at: Instant) -> usize {
        self.entries.push_back(QueuedTask {
            task,
            enqueued_at: now,
            ready_at,
        });
        self.entries.len() - 1
    }

    /// Put an interrupted task back at the head, ready immediately.
    pub fn push_front(&mut self, task: Task, now: Instant) {
        self.entries.push_front(QueuedTask {
            task,
            enqueued_at: now,
            ready_at: now,
        });
    }

    pub fn get(&self, index: usize) -> Option<&QueuedTask> {
        self.entries.get(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<QueuedTask> {
        self.entries.remove(index)
    }

    pub fn position(&self, task_id: &TaskId) -> Option<usize> {
        self.entries.iter().position(|e| &e.task.id == task_id)
    }

    /// Remove the first ready task accepted by `pred`.
    pub fn take_first(&mut self, now: Instant, pred: impl Fn(&Task) -> bool) -> Option<Task> {
        let index = self
            .entries
            .iter()
            .position(|e| e.is_ready(now) && pred(&e.task))?;
        self.entries.remove(index).map(|e| e.task)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.entries.iter()
    }

    pub fn ready_count(&self, now: Instant) -> usize {
        self.entries.iter().filter(|e| e.is_ready(now)).count()
    }

    pub fn count_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.task.task_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn oldest_wait(&self, now: Instant) -> Duration {
        self.entries
            .iter()
            .map(|e| now.saturating_duration_since(e.enqueued_at))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn drain(&mut self) -> Vec<Task> {
        self.entries.drain(..).map(|e| e.task).collect()
    }
}
