//! Newline-delimited JSON task input.
//!
//! ```text
//! {"type": "ocr_processing", "priority": 4, "data": {"doc": "exhibit-4.pdf"}}
//! {"id": "brief-12", "type": "legal_analysis", "timeout": "2m", "max_retries": 1}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{Context, bail};
use serde::Deserialize;

use docket_core::{MAX_PRIORITY, MIN_PRIORITY, Task, parse_duration};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskRequest {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: Option<u8>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timeout: Option<String>,
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn into_task(self) -> anyhow::Result<Task> {
        if self.task_type.trim().is_empty() {
            bail!("task type must not be empty");
        }
        let mut task = Task::new(self.task_type, self.data);
        if let Some(id) = self.id {
            task = task.with_id(id);
        }
        if let Some(priority) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                bail!("priority {priority} outside {MIN_PRIORITY}..={MAX_PRIORITY}");
            }
            task = task.with_priority(priority);
        }
        if let Some(timeout) = self.timeout {
            let timeout = parse_duration(&timeout)
                .with_context(|| format!("invalid timeout '{timeout}'"))?;
            task = task.with_timeout(timeout);
        }
        if let Some(max_retries) = self.max_retries {
            task = task.with_max_retries(max_retries);
        }
        Ok(task)
    }
}

/// Parse one input line. `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> anyhow::Result<Option<Task>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let request: TaskRequest = serde_json::from_str(line).context("malformed task")?;
    request.into_task().map(Some)
}
