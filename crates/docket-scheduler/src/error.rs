//! Scheduler error types.

use thiserror::Error;

use docket_core::{ConfigError, TaskId, WorkerId};

use crate::worker::WorkerStatus;

/// Errors returned by pool operations.
///
/// Task execution failures are not errors of the pool; they are reported
/// through `PoolEvent::TaskFailed`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task already submitted: {0}")]
    DuplicateTask(TaskId),

    #[error("worker {worker_id} cannot move from {from} to {to}")]
    InvalidTransition {
        worker_id: WorkerId,
        from: WorkerStatus,
        to: WorkerStatus,
    },

    #[error("worker pool is not running")]
    NotRunning,
}

impl From<ConfigError> for SchedulerError {
    fn from(err: ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
