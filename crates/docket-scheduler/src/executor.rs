//! The execution seam between the pool and the code that does the work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use docket_core::{Task, WorkerId, WorkerType};

/// Why a single execution attempt failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed(message.into())
    }

    /// Cancelled attempts are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Cancelled(_))
    }
}

/// The worker an attempt runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerContext {
    pub worker_id: WorkerId,
    pub worker_type: WorkerType,
    pub capabilities: &'static [&'static str],
}

/// Runs one task attempt.
///
/// Called from a spawned tokio task, never under the pool lock. The pool
/// applies the task timeout around the call and contains panics.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        worker: &WorkerContext,
        task: Arc<Task>,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Adapts an async closure into a `TaskExecutor`.
pub struct FnExecutor<F>(F);

impl<F, Fut> FnExecutor<F>
where
    F: Fn(WorkerContext, Arc<Task>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(WorkerContext, Arc<Task>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    async fn execute(
        &self,
        worker: &WorkerContext,
        task: Arc<Task>,
    ) -> Result<serde_json::Value, ExecutionError> {
        (self.0)(worker.clone(), task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_cancellation_is_final() {
        assert!(ExecutionError::failed("bad input").is_retryable());
        assert!(ExecutionError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ExecutionError::Cancelled("pool stopped".into()).is_retryable());
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ExecutionError::Timeout(Duration::from_millis(1500)).to_string(),
            "timed out after 1500ms"
        );
        assert_eq!(ExecutionError::failed("boom").to_string(), "boom");
    }

    #[tokio::test]
    async fn fn_executor_forwards_worker_and_task() {
        let executor = FnExecutor::new(|worker: WorkerContext, task: Arc<Task>| async move {
            Ok::<_, ExecutionError>(
                json!({ "worker": worker.worker_id.to_string(), "task": task.task_type }),
            )
        });
        let ctx = WorkerContext {
            worker_id: WorkerId::new(WorkerType::LegalAnalyzer, 3),
            worker_type: WorkerType::LegalAnalyzer,
            capabilities: WorkerType::LegalAnalyzer.capabilities(),
        };
        let out = executor
            .execute(&ctx, Arc::new(Task::new("legal_analysis", json!({}))))
            .await
            .unwrap();
        assert_eq!(out, json!({ "worker": "legal_analyzer-3", "task": "legal_analysis" }));
    }
}
