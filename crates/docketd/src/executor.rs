//! Command-backed task executor.
//!
//! Each task type maps to an argv from `[executor.commands]`. The task
//! payload is written to the child's stdin as JSON; stdout is parsed as
//! JSON, or returned as a string when it isn't. A non-zero exit fails the
//! attempt with the child's stderr. Children are killed if the attempt is
//! aborted or times out.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use docket_core::Task;
use docket_scheduler::{ExecutionError, TaskExecutor, WorkerContext};

pub struct CommandExecutor {
    commands: BTreeMap<String, Vec<String>>,
}

impl CommandExecutor {
    pub fn new(commands: BTreeMap<String, Vec<String>>) -> Self {
        Self { commands }
    }

    pub fn command_for(&self, task_type: &str) -> Option<&[String]> {
        self.commands
            .get(task_type)
            .map(Vec::as_slice)
            .filter(|argv| !argv.is_empty())
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        worker: &WorkerContext,
        task: Arc<Task>,
    ) -> Result<serde_json::Value, ExecutionError> {
        let argv = self.command_for(&task.task_type).ok_or_else(|| {
            ExecutionError::Failed(format!(
                "no command configured for task type '{}'",
                task.task_type
            ))
        })?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecutionError::failed("empty command"))?;

        debug!(
            worker_id = %worker.worker_id,
            task_id = %task.id,
            %program,
            "spawning task command"
        );
        let mut child = Command::new(program)
            .args(args)
            .env("DOCKET_TASK_ID", task.id.as_str())
            .env("DOCKET_TASK_TYPE", &task.task_type)
            .env("DOCKET_WORKER_ID", worker.worker_id.as_str())
            .env("DOCKET_WORKER_TYPE", worker.worker_type.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Failed(format!("failed to spawn {program}: {e}")))?;

        let payload = serde_json::to_vec(&task.data)
            .map_err(|e| ExecutionError::Failed(format!("unserializable payload: {e}")))?;
        // Feed stdin while stdout is drained; a filter like `cat` blocks on
        // a full stdout pipe before it has read all of its input.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // Commands that ignore stdin may exit before reading it.
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            Ok(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output
            .map_err(|e| ExecutionError::Failed(format!("failed to wait for {program}: {e}")))?;
        fed.map_err(|e| ExecutionError::Failed(format!("failed to write payload: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutionError::Failed(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(parse_output(&output.stdout))
    }
}

fn parse_output(stdout: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{WorkerId, WorkerType};
    use serde_json::json;

    fn ctx() -> WorkerContext {
        WorkerContext {
            worker_id: WorkerId::new(WorkerType::DocumentProcessor, 1),
            worker_type: WorkerType::DocumentProcessor,
            capabilities: WorkerType::DocumentProcessor.capabilities(),
        }
    }

    fn executor(task_type: &str, argv: &[&str]) -> CommandExecutor {
        let mut commands = BTreeMap::new();
        commands.insert(
            task_type.to_string(),
            argv.iter().map(|s| s.to_string()).collect(),
        );
        CommandExecutor::new(commands)
    }

    #[test]
    fn output_parsing() {
        assert_eq!(parse_output(b"{\"pages\": 3}\n"), json!({ "pages": 3 }));
        assert_eq!(parse_output(b"  plain text \n"), json!("plain text"));
        assert_eq!(parse_output(b"\n"), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn payload_round_trips_through_cat() {
        let exec = executor("ocr_processing", &["cat"]);
        let task = Task::new("ocr_processing", json!({ "doc": "exhibit-4.pdf" }));
        let out = exec.execute(&ctx(), Arc::new(task)).await.unwrap();
        assert_eq!(out, json!({ "doc": "exhibit-4.pdf" }));
    }

    #[tokio::test]
    async fn large_payload_does_not_stall_a_streaming_command() {
        let exec = executor("ocr_processing", &["cat"]);
        let pages: Vec<String> = (0..20_000)
            .map(|i| format!("page {i} of the deposition transcript"))
            .collect();
        let data = json!({ "pages": pages });
        let task = Task::new("ocr_processing", data.clone());

        let out = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            exec.execute(&ctx(), Arc::new(task)),
        )
        .await
        .expect("command stalled on a full pipe")
        .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn environment_describes_the_attempt() {
        let exec = executor("ocr_processing", &["sh", "-c", "echo $DOCKET_WORKER_ID"]);
        let task = Task::new("ocr_processing", json!({}));
        let out = exec.execute(&ctx(), Arc::new(task)).await.unwrap();
        assert_eq!(out, json!("document_processor-1"));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let exec = executor("ocr_processing", &["sh", "-c", "echo unreadable scan >&2; exit 3"]);
        let task = Task::new("ocr_processing", json!({}));
        let err = exec.execute(&ctx(), Arc::new(task)).await.unwrap_err();
        match err {
            ExecutionError::Failed(msg) => assert!(msg.contains("unreadable scan"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_command_fails() {
        let exec = executor("ocr_processing", &["cat"]);
        let task = Task::new("legal_analysis", json!({}));
        let err = exec.execute(&ctx(), Arc::new(task)).await.unwrap_err();
        assert!(err.to_string().contains("legal_analysis"));
    }
}
