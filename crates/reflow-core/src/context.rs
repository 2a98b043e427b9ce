//! Execution context
//!
//! The durable record of one workflow run: identity, immutable input, and
//! the append-only event list. Everything else (`started`, `paused`,
//! `output`, …) is derived from the events, never stored separately.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{EventValue, ExecutionEvent, ExecutionEventKind};

/// Terminal/derived status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The durable record of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Globally unique identifier, stable across resumes
    pub execution_id: String,

    /// Workflow logical name (catalog key)
    pub name: String,

    /// User input; immutable after creation except for the documented
    /// pause-with-input rewrite on resume
    pub input: Value,

    /// Ordered, append-only event list
    pub events: Vec<ExecutionEvent>,
}

impl ExecutionContext {
    /// Create a fresh context with a new execution id
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            execution_id: Uuid::now_v7().simple().to_string(),
            name: name.into(),
            input,
            events: Vec::new(),
        }
    }

    /// Create a context with a caller-provided execution id
    pub fn with_execution_id(
        execution_id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            name: name.into(),
            input,
            events: Vec::new(),
        }
    }

    /// Append one event. The list is append-only; nothing is ever mutated
    /// or removed.
    pub fn append(&mut self, event: ExecutionEvent) {
        self.events.push(event);
    }

    fn count(&self, kind: ExecutionEventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    pub fn started(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == ExecutionEventKind::WorkflowStarted)
    }

    pub fn finished(&self) -> bool {
        self.events.iter().any(|e| e.kind.is_workflow_terminal())
    }

    pub fn succeeded(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == ExecutionEventKind::WorkflowCompleted)
    }

    pub fn failed(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == ExecutionEventKind::WorkflowFailed)
    }

    /// Paused when pauses outnumber resumes by one
    pub fn paused(&self) -> bool {
        self.count(ExecutionEventKind::WorkflowPaused)
            > self.count(ExecutionEventKind::WorkflowResumed)
    }

    /// Resumed at least once and not currently paused
    pub fn resumed(&self) -> bool {
        self.count(ExecutionEventKind::WorkflowResumed) > 0 && !self.paused()
    }

    /// The most recent `WORKFLOW_PAUSED` event, if any
    pub fn last_pause(&self) -> Option<&ExecutionEvent> {
        self.events
            .iter()
            .rev()
            .find(|e| e.kind == ExecutionEventKind::WorkflowPaused)
    }

    /// Payload of the terminal `WORKFLOW_COMPLETED` event
    pub fn output(&self) -> Option<&EventValue> {
        self.events
            .iter()
            .find(|e| e.kind == ExecutionEventKind::WorkflowCompleted)
            .map(|e| &e.value)
    }

    pub fn status(&self) -> ExecutionStatus {
        if self.succeeded() {
            ExecutionStatus::Completed
        } else if self.failed() {
            ExecutionStatus::Failed
        } else if self.paused() {
            ExecutionStatus::Paused
        } else {
            ExecutionStatus::Running
        }
    }

    /// Find the terminal task event (`TASK_COMPLETED` / `TASK_FAILED`) for a
    /// source id. This is the replay oracle lookup.
    pub fn task_terminal(&self, source_id: &str) -> Option<&ExecutionEvent> {
        self.events
            .iter()
            .find(|e| e.kind.is_task_terminal() && e.source_id == source_id)
    }

    /// Whether an event with the given dedup key is already recorded
    pub fn contains(&self, source_id: &str, kind: ExecutionEventKind) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == kind && e.source_id == source_id)
    }

    /// Condensed view returned by the HTTP/CLI façades
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            execution_id: self.execution_id.clone(),
            name: self.name.clone(),
            input: self.input.clone(),
            output: self.output().and_then(|v| v.as_data().cloned()),
            status: self.status(),
        }
    }
}

/// Summary of a context: everything but the event list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub execution_id: String,
    pub name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub status: ExecutionStatus,
}
