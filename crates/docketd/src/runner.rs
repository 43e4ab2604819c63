//! The `run` loop: feed tasks into the pool and stream its events.

use std::collections::HashSet;
use std::future::Future;
use std::io::Write;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use docket_core::TaskId;
use docket_scheduler::{PoolEvent, PoolStatistics, WorkerPool};

use crate::tasks::parse_line;

/// Outcome counts for one `run` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
struct FinalReport<'a> {
    summary: &'a RunSummary,
    statistics: &'a PoolStatistics,
}

struct Tracker<W> {
    out: W,
    outstanding: HashSet<TaskId>,
    summary: RunSummary,
}

impl<W: Write> Tracker<W> {
    fn record(&mut self, event: &PoolEvent) -> anyhow::Result<()> {
        writeln!(self.out, "{}", serde_json::to_string(event)?)?;
        if !event.is_terminal() {
            return Ok(());
        }
        let Some(task_id) = event.task_id() else {
            return Ok(());
        };
        if self.outstanding.remove(task_id) {
            match event {
                PoolEvent::TaskCompleted { .. } => self.summary.completed += 1,
                _ => self.summary.failed += 1,
            }
        }
        Ok(())
    }
}

/// Start `pool`, submit every task read from `input`, and write each pool
/// event to `out` as a JSON line.
///
/// Returns once the input is exhausted and every accepted task reached a
/// terminal outcome, or when `shutdown` resolves. The pool is stopped
/// before returning and a final summary line is written.
pub async fn run<R, W, S>(
    pool: &WorkerPool,
    input: R,
    out: W,
    shutdown: S,
) -> anyhow::Result<RunSummary>
where
    R: AsyncBufRead + Unpin,
    W: Write,
    S: Future<Output = ()>,
{
    let mut events = pool.subscribe().await;
    pool.start().await?;

    let mut tracker = Tracker {
        out,
        outstanding: HashSet::new(),
        summary: RunSummary::default(),
    };
    let mut lines = input.lines();
    let mut input_open = true;
    let mut line_no = 0usize;
    tokio::pin!(shutdown);

    while input_open || !tracker.outstanding.is_empty() {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                let Some(line) = line? else {
                    debug!(lines = line_no, "task input closed");
                    input_open = false;
                    continue;
                };
                line_no += 1;
                let task = match parse_line(&line) {
                    Ok(Some(task)) => task,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(line = line_no, error = %format!("{e:#}"), "invalid task line");
                        tracker.summary.rejected += 1;
                        continue;
                    }
                };
                let task_id = task.id.clone();
                match pool.assign_task(task).await {
                    Ok(_) => {
                        tracker.outstanding.insert(task_id);
                        tracker.summary.submitted += 1;
                    }
                    Err(e) => {
                        warn!(line = line_no, %task_id, error = %e, "task rejected");
                        tracker.summary.rejected += 1;
                    }
                }
            }
            Some(event) = events.recv() => tracker.record(&event)?,
            _ = &mut shutdown => {
                info!(outstanding = tracker.outstanding.len(), "shutdown requested");
                break;
            }
        }
    }

    pool.stop().await;
    // Cancellations published by `stop`.
    while let Ok(event) = events.try_recv() {
        tracker.record(&event)?;
    }

    let statistics = pool.pool_statistics().await;
    let report = FinalReport {
        summary: &tracker.summary,
        statistics: &statistics,
    };
    writeln!(tracker.out, "{}", serde_json::to_string(&report)?)?;
    tracker.out.flush()?;

    info!(
        submitted = tracker.summary.submitted,
        completed = tracker.summary.completed,
        failed = tracker.summary.failed,
        rejected = tracker.summary.rejected,
        "run finished"
    );
    Ok(tracker.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use docket_core::{PoolConfig, WorkerType};
    use docket_scheduler::{ExecutionError, FnExecutor};
    use serde_json::{Value, json};

    fn pool() -> WorkerPool {
        let mut config = PoolConfig::single_type(WorkerType::DocumentProcessor, 2, 2);
        config.health.enabled = false;
        config.scaling.enabled = false;
        config.retry.max_retries = 0;
        let executor = FnExecutor::new(|_worker, task: Arc<docket_core::Task>| async move {
            if task.data.get("fail").is_some() {
                Err(ExecutionError::failed("unreadable scan"))
            } else {
                Ok::<_, ExecutionError>(json!({ "echo": task.data.clone() }))
            }
        });
        WorkerPool::new(config, Arc::new(executor))
    }

    fn lines(out: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn runs_until_every_task_is_terminal() {
        let pool = pool();
        let input = concat!(
            "{\"id\": \"a\", \"type\": \"ocr_processing\", \"data\": {\"n\": 1}}\n",
            "# comment\n",
            "{\"id\": \"b\", \"type\": \"ocr_processing\", \"data\": {\"fail\": true}}\n",
            "garbage\n",
            "{\"id\": \"c\", \"type\": \"no_such_type\"}\n",
        );
        let mut out = Vec::new();
        let summary = run(&pool, input.as_bytes(), &mut out, std::future::pending())
            .await
            .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                submitted: 2,
                rejected: 2,
                completed: 1,
                failed: 1,
            }
        );
        assert!(!pool.is_running().await);

        let events = lines(&out);
        let completed = events
            .iter()
            .find(|e| e["event"] == "task_completed")
            .unwrap();
        assert_eq!(completed["task_id"], "a");
        assert_eq!(completed["output"], json!({ "echo": { "n": 1 } }));
        let failed = events.iter().find(|e| e["event"] == "task_failed").unwrap();
        assert_eq!(failed["task_id"], "b");

        let report = events.last().unwrap();
        assert_eq!(report["summary"]["completed"], 1);
        assert_eq!(report["statistics"]["running"], false);
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_work() {
        let mut config = PoolConfig::single_type(WorkerType::DocumentProcessor, 1, 1);
        config.health.enabled = false;
        config.scaling.enabled = false;
        let executor = FnExecutor::new(|_worker, _task| async move {
            std::future::pending::<()>().await;
            Ok::<_, ExecutionError>(Value::Null)
        });
        let pool = WorkerPool::new(config, Arc::new(executor));

        let input = "{\"id\": \"stuck\", \"type\": \"ocr_processing\"}\n";
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut out = Vec::new();
        let shutdown = async move {
            let _ = rx.await;
        };
        let summary = {
            let runner = run(&pool, input.as_bytes(), &mut out, shutdown);
            tokio::pin!(runner);

            // Let the task reach the worker, then signal.
            tokio::select! {
                _ = &mut runner => panic!("run returned with a hung task outstanding"),
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }
            tx.send(()).unwrap();
            runner.await.unwrap()
        };

        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.failed, 1);
        let events = lines(&out);
        let cancelled = events.iter().find(|e| e["event"] == "task_failed").unwrap();
        assert_eq!(cancelled["task_id"], "stuck");
    }
}
