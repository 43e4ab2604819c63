//! Shared types used across Docket crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Workers ────────────────────────────────────────────────────────

/// Capability class of a worker. Fixed for the worker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    DocumentProcessor,
    LegalAnalyzer,
    SearchIndexer,
    CrossDocumentAnalyzer,
    EntityResolver,
    TimelineAnalyzer,
}

impl WorkerType {
    pub const ALL: [WorkerType; 6] = [
        WorkerType::DocumentProcessor,
        WorkerType::LegalAnalyzer,
        WorkerType::SearchIndexer,
        WorkerType::CrossDocumentAnalyzer,
        WorkerType::EntityResolver,
        WorkerType::TimelineAnalyzer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::DocumentProcessor => "document_processor",
            WorkerType::LegalAnalyzer => "legal_analyzer",
            WorkerType::SearchIndexer => "search_indexer",
            WorkerType::CrossDocumentAnalyzer => "cross_document_analyzer",
            WorkerType::EntityResolver => "entity_resolver",
            WorkerType::TimelineAnalyzer => "timeline_analyzer",
        }
    }

    /// Capability tags advertised by every worker of this type.
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            WorkerType::DocumentProcessor => &["pdf_extraction", "ocr", "text_normalization"],
            WorkerType::LegalAnalyzer => &["issue_spotting", "legal_reasoning", "summarization"],
            WorkerType::SearchIndexer => &["tokenization", "embedding", "index_update"],
            WorkerType::CrossDocumentAnalyzer => {
                &["cross_reference", "contradiction_detection", "similarity"]
            }
            WorkerType::EntityResolver => &["entity_extraction", "deduplication", "linking"],
            WorkerType::TimelineAnalyzer => &["date_extraction", "event_ordering", "chronology"],
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| ConfigError::UnknownWorkerType(s.to_string()))
    }
}

/// Unique worker identifier, `<type>-<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(worker_type: WorkerType, sequence: u64) -> Self {
        Self(format!("{worker_type}-{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Unique task identifier. Random UUID unless the caller supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;
pub const DEFAULT_PRIORITY: u8 = 3;

/// A unit of work submitted to the pool.
///
/// `timeout` and `max_retries` fall back to the pool's defaults when unset.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub priority: u8,
    pub data: serde_json::Value,
    pub timeout: Option<Duration>,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: task_type.into(),
            priority: DEFAULT_PRIORITY,
            data,
            timeout: None,
            retry_count: 0,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority, clamped to `1..=5`.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Estimated run time given a per-task baseline.
    ///
    /// Higher-priority tasks get a larger estimate (`0.5 + priority / 5`).
    pub fn estimated_duration(&self, base: Duration) -> Duration {
        let priority = self.priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        base.mul_f64(0.5 + f64::from(priority) / f64::from(MAX_PRIORITY))
    }
}

// ── Compatibility ──────────────────────────────────────────────────

/// Many-to-one mapping from task type to the worker types that can run it.
///
/// The first worker type listed for a task type is its primary type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatibilityTable {
    entries: BTreeMap<String, Vec<WorkerType>>,
}

impl CompatibilityTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert or replace the worker types for a task type.
    pub fn insert(&mut self, task_type: impl Into<String>, worker_types: Vec<WorkerType>) {
        self.entries.insert(task_type.into(), worker_types);
    }

    /// Worker types compatible with `task_type`, or `None` if unmapped.
    pub fn worker_types_for(&self, task_type: &str) -> Option<&[WorkerType]> {
        self.entries
            .get(task_type)
            .map(Vec::as_slice)
            .filter(|types| !types.is_empty())
    }

    pub fn primary_worker_type(&self, task_type: &str) -> Option<WorkerType> {
        self.worker_types_for(task_type)
            .and_then(|types| types.first().copied())
    }

    pub fn is_compatible(&self, task_type: &str, worker_type: WorkerType) -> bool {
        self.worker_types_for(task_type)
            .is_some_and(|types| types.contains(&worker_type))
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CompatibilityTable {
    fn default() -> Self {
        let mut table = Self::empty();
        let defaults: [(&str, WorkerType); 13] = [
            ("document_extraction", WorkerType::DocumentProcessor),
            ("ocr_processing", WorkerType::DocumentProcessor),
            ("text_extraction", WorkerType::DocumentProcessor),
            ("legal_analysis", WorkerType::LegalAnalyzer),
            ("issue_extraction", WorkerType::LegalAnalyzer),
            ("search_indexing", WorkerType::SearchIndexer),
            ("embedding_generation", WorkerType::SearchIndexer),
            ("cross_document_analysis", WorkerType::CrossDocumentAnalyzer),
            ("contradiction_detection", WorkerType::CrossDocumentAnalyzer),
            ("entity_resolution", WorkerType::EntityResolver),
            ("entity_extraction", WorkerType::EntityResolver),
            ("timeline_analysis", WorkerType::TimelineAnalyzer),
            ("chronology_extraction", WorkerType::TimelineAnalyzer),
        ];
        for (task_type, worker_type) in defaults {
            table.insert(task_type, vec![worker_type]);
        }
        table
    }
}

// ── Resource pressure ──────────────────────────────────────────────

/// Severity of an external resource-pressure alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    /// Whether the pool should shed workers immediately.
    pub fn requires_shedding(&self) -> bool {
        matches!(self, AlertSeverity::Critical | AlertSeverity::Emergency)
    }
}

/// Alert emitted by an external resource monitor (memory, CPU, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub severity: AlertSeverity,
    pub resource: String,
    pub message: String,
}

impl ResourceAlert {
    pub fn new(
        severity: AlertSeverity,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            resource: resource.into(),
            message: message.into(),
        }
    }
}
