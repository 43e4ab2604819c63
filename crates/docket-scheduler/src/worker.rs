//! Worker data model and state machine.
//!
//! ```text
//! initializing ──▶ idle ◀──▶ busy
//!                   ▲ │        │
//!                   │ ▼        ▼
//!                   └─ error ◀─┘
//!
//! any ──▶ shutdown (terminal)
//! ```
//!
//! `current_task` is set exactly while the worker is `busy`; every
//! transition method preserves that.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use docket_core::{TaskId, WorkerId, WorkerType};
use docket_health::HealthSample;

use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::WorkerContext;
use crate::load_balancer::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Idle,
    Busy,
    Error,
    Shutdown,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Initializing => "initializing",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
            WorkerStatus::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Throughput counters. Processing time covers every attempt, successful
/// or not.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPerformance {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_processing: Duration,
    pub average_processing: Duration,
    /// completed / (completed + failed), 1.0 before the first attempt.
    pub efficiency: f64,
}

impl WorkerPerformance {
    fn new() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            total_processing: Duration::ZERO,
            average_processing: Duration::ZERO,
            efficiency: 1.0,
        }
    }

    fn record(&mut self, elapsed: Duration, success: bool) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let attempts = self.attempts();
        self.total_processing += elapsed;
        self.average_processing = self.total_processing.div_f64(attempts as f64);
        self.efficiency = (self.tasks_completed as f64 / attempts as f64).clamp(0.0, 1.0);
    }

    pub fn attempts(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHealth {
    pub score: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// One execution slot in the pool.
#[derive(Debug, Clone)]
pub struct Worker {
    id: WorkerId,
    sequence: u64,
    worker_type: WorkerType,
    status: WorkerStatus,
    current_task: Option<TaskId>,
    performance: WorkerPerformance,
    health: WorkerHealth,
    created_at: Instant,
    last_heartbeat: Instant,
}

impl Worker {
    pub(crate) fn new(worker_type: WorkerType, sequence: u64, now: Instant) -> Self {
        Self {
            id: WorkerId::new(worker_type, sequence),
            sequence,
            worker_type,
            status: WorkerStatus::Initializing,
            current_task: None,
            performance: WorkerPerformance::new(),
            health: WorkerHealth {
                score: 1.0,
                consecutive_failures: 0,
                last_error: None,
            },
            created_at: now,
            last_heartbeat: now,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Creation order within the pool.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_task(&self) -> Option<&TaskId> {
        self.current_task.as_ref()
    }

    pub fn capabilities(&self) -> &'static [&'static str] {
        self.worker_type.capabilities()
    }

    pub fn performance(&self) -> &WorkerPerformance {
        &self.performance
    }

    pub fn health(&self) -> &WorkerHealth {
        &self.health
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// `busy` exactly when a task is recorded.
    pub fn is_consistent(&self) -> bool {
        (self.status == WorkerStatus::Busy) == self.current_task.is_some()
    }

    // ── Transitions ────────────────────────────────────────────────

    /// `initializing → idle`.
    pub(crate) fn mark_ready(&mut self) -> SchedulerResult<()> {
        self.transition(&[WorkerStatus::Initializing], WorkerStatus::Idle)
    }

    /// `idle → busy`. Refreshes the heartbeat.
    pub(crate) fn assign(&mut self, task_id: TaskId, now: Instant) -> SchedulerResult<()> {
        self.transition(&[WorkerStatus::Idle], WorkerStatus::Busy)?;
        self.current_task = Some(task_id);
        self.last_heartbeat = now;
        Ok(())
    }

    /// `busy → idle` after a successful run.
    pub(crate) fn complete(&mut self, elapsed: Duration) -> SchedulerResult<TaskId> {
        self.transition(&[WorkerStatus::Busy], WorkerStatus::Idle)?;
        self.performance.record(elapsed, true);
        self.health.consecutive_failures = 0;
        Ok(self.take_task())
    }

    /// `busy → error` after a failed run.
    pub(crate) fn fail(&mut self, elapsed: Duration, error: String) -> SchedulerResult<TaskId> {
        self.transition(&[WorkerStatus::Busy], WorkerStatus::Error)?;
        self.performance.record(elapsed, false);
        self.health.consecutive_failures += 1;
        self.health.last_error = Some(error);
        Ok(self.take_task())
    }

    /// `error → idle` while under the restart threshold.
    pub(crate) fn recover(&mut self) -> SchedulerResult<()> {
        self.transition(&[WorkerStatus::Error], WorkerStatus::Idle)
    }

    /// Any state `→ shutdown`. Returns the task that was running, if any.
    pub(crate) fn shutdown(&mut self) -> Option<TaskId> {
        self.status = WorkerStatus::Shutdown;
        self.current_task.take()
    }

    pub(crate) fn set_health_score(&mut self, score: f64) {
        self.health.score = score.clamp(0.0, 1.0);
    }

    fn transition(&mut self, from: &[WorkerStatus], to: WorkerStatus) -> SchedulerResult<()> {
        if !from.contains(&self.status) {
            return Err(SchedulerError::InvalidTransition {
                worker_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn take_task(&mut self) -> TaskId {
        // Only reachable from `busy`, where a task is always recorded.
        self.current_task
            .take()
            .unwrap_or_else(|| TaskId::from("unknown"))
    }

    // ── Views ──────────────────────────────────────────────────────

    pub(crate) fn context(&self) -> WorkerContext {
        WorkerContext {
            worker_id: self.id.clone(),
            worker_type: self.worker_type,
            capabilities: self.capabilities(),
        }
    }

    pub(crate) fn candidate(&self) -> Candidate {
        Candidate {
            sequence: self.sequence,
            worker_type: self.worker_type,
            tasks_completed: self.performance.tasks_completed,
            efficiency: self.performance.efficiency,
            health_score: self.health.score,
        }
    }

    pub fn health_sample(&self) -> HealthSample {
        HealthSample {
            efficiency: self.performance.efficiency,
            average_processing: self.performance.average_processing,
            consecutive_failures: self.health.consecutive_failures,
            busy: self.status == WorkerStatus::Busy,
            last_heartbeat: self.last_heartbeat,
        }
    }

    /// Health score weighted by efficiency, used to pick scale-down victims.
    pub(crate) fn retention_score(&self) -> f64 {
        self.health.score * self.performance.efficiency
    }

    pub fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            worker_type: self.worker_type,
            status: self.status,
            current_task: self.current_task.clone(),
            capabilities: self.capabilities().iter().map(|c| c.to_string()).collect(),
            tasks_completed: self.performance.tasks_completed,
            tasks_failed: self.performance.tasks_failed,
            average_processing_ms: self.performance.average_processing.as_millis() as u64,
            efficiency: self.performance.efficiency,
            health_score: self.health.score,
            consecutive_failures: self.health.consecutive_failures,
            last_error: self.health.last_error.clone(),
            uptime_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            heartbeat_age_ms: now.saturating_duration_since(self.last_heartbeat).as_millis() as u64,
        }
    }
}

/// Read-only snapshot of a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub worker_type: WorkerType,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub capabilities: Vec<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_processing_ms: u64,
    pub efficiency: f64,
    pub health_score: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub uptime_ms: u64,
    pub heartbeat_age_ms: u64,
}
