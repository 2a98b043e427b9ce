//! Execution events
//!
//! Events form the append-only log for a workflow execution. They are used
//! for:
//! - Persisting workflow progress
//! - Replaying executions after a crash, pause, or forced rerun
//! - Auditing and debugging
//!
//! Events are immutable once written. Replay never re-executes a task whose
//! terminal event is already in the log; the recorded value is fed back to
//! the workflow instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FailureInfo;
use crate::output::StoredValue;

/// The fifteen event kinds a workflow execution can record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEventKind {
    // Workflow lifecycle
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowPaused,
    WorkflowResumed,

    // Task lifecycle
    TaskStarted,
    TaskCompleted,
    TaskFailed,

    // Retry framing
    TaskRetryStarted,
    TaskRetryCompleted,
    TaskRetryFailed,

    // Fallback framing
    TaskFallbackStarted,
    TaskFallbackCompleted,

    // Rollback framing
    TaskRollbackStarted,
    TaskRollbackCompleted,
}

impl ExecutionEventKind {
    /// Terminal workflow events close the log; nothing may follow them
    pub fn is_workflow_terminal(&self) -> bool {
        matches!(self, Self::WorkflowCompleted | Self::WorkflowFailed)
    }

    /// Terminal task events settle one task invocation
    pub fn is_task_terminal(&self) -> bool {
        matches!(self, Self::TaskCompleted | Self::TaskFailed)
    }
}

impl std::fmt::Display for ExecutionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{s}")
    }
}

/// Retry metadata carried by `TASK_RETRY_*` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Current attempt (1-based)
    pub attempt: u32,

    /// Configured upper bound on attempts
    pub max_attempts: u32,

    /// Delay applied before this attempt, in seconds
    pub delay_secs: u64,

    /// Multiplicative backoff factor
    pub backoff: f64,
}

/// Payload of an execution event, a closed sum over the known shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventValue {
    /// No payload (framing-only events)
    Null,

    /// Plain JSON payload: inputs, return values, pause references
    Data { value: serde_json::Value },

    /// A task/workflow output routed through output storage
    Stored { output: StoredValue },

    /// Retry attempt metadata
    Retry { state: RetryState },

    /// A failure record
    Failure { error: FailureInfo },
}

impl EventValue {
    pub fn data(value: serde_json::Value) -> Self {
        Self::Data { value }
    }

    /// The inline JSON view of this payload, if it has one
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data { value } => Some(value),
            Self::Stored {
                output: StoredValue::Inline { value },
            } => Some(value),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&FailureInfo> {
        match self {
            Self::Failure { error } => Some(error),
            _ => None,
        }
    }

    pub fn as_retry(&self) -> Option<&RetryState> {
        match self {
            Self::Retry { state } => Some(state),
            _ => None,
        }
    }

    pub fn as_stored(&self) -> Option<&StoredValue> {
        match self {
            Self::Stored { output } => Some(output),
            _ => None,
        }
    }
}

/// One record in the execution event log
///
/// `source_id` identifies the emitting entity: `{name}_{execution_id}` for a
/// workflow, `{task_name}_{stable_hash(...)}` for a task (see
/// [`crate::hashing::stable_task_id`]). `time` is diagnostic only; ordering
/// and replay never depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub kind: ExecutionEventKind,
    pub source_id: String,
    pub name: String,
    pub value: EventValue,
    pub time: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(
        kind: ExecutionEventKind,
        source_id: impl Into<String>,
        name: impl Into<String>,
        value: EventValue,
    ) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            name: name.into(),
            value,
            time: Utc::now(),
        }
    }

    /// The dedup key that makes persistence idempotent
    pub fn dedup_key(&self) -> (String, ExecutionEventKind) {
        (self.source_id.clone(), self.kind)
    }
}

/// Source id of the workflow itself within one execution
pub fn workflow_source_id(name: &str, execution_id: &str) -> String {
    format!("{name}_{execution_id}")
}

/// Source id of a pause point, scoped to its reference
///
/// Each pause point must own a distinct `(source_id, type)` pair or the
/// store's dedup key would collapse successive pauses of one run.
pub fn pause_source_id(workflow_source: &str, reference: &str) -> String {
    format!("{workflow_source}_pause_{reference}")
}
