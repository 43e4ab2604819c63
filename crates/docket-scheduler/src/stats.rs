//! Read-only views over the pool.

use std::collections::BTreeMap;

use serde::Serialize;

use docket_core::{WorkerId, WorkerType};

/// Aggregate pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatistics {
    pub running: bool,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub error_workers: usize,
    pub workers_by_type: BTreeMap<WorkerType, usize>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Mean over every attempt on every current worker.
    pub average_processing_ms: f64,
    pub average_health: f64,
    pub average_efficiency: f64,
    pub queue_length: usize,
    /// Same load figure the autoscaler acts on.
    pub load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub length: usize,
    pub ready: usize,
    /// Retries still waiting out their backoff.
    pub delayed: usize,
    pub by_type: BTreeMap<String, usize>,
    pub oldest_wait_ms: u64,
    /// Rough time to clear the backlog with the current workers.
    pub estimated_drain_ms: u64,
}

/// Where a submitted task currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskLocation {
    Queued { position: usize },
    Running { worker_id: WorkerId },
}
