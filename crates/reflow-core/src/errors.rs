//! Engine error types
//!
//! Errors inside a task's execution are handled locally by the task state
//! machine (retry → fallback → rollback → raise). Errors escaping a task are
//! delivered into the workflow body, which may catch them. An error escaping
//! the workflow body is recorded as `WORKFLOW_FAILED`.
//!
//! `EngineError::Paused` is a control signal, not a fault: it unwinds the
//! workflow to the runtime, which records `WORKFLOW_PAUSED` and returns the
//! context without a terminal event.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Scope of a timeout (workflow-level or task-level)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Workflow,
    Task,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "Workflow"),
            Self::Task => write!(f, "Task"),
        }
    }
}

/// Errors produced by the workflow engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A task ultimately failed; wraps the underlying failure message
    #[error("execution failed: {0}")]
    Execution(String),

    /// Retries exhausted with no fallback
    #[error(
        "retries exhausted after {attempts} attempts (delay {delay_secs}s, backoff {backoff}): {cause}"
    )]
    RetryExhausted {
        cause: String,
        attempts: u32,
        delay_secs: u64,
        backoff: f64,
    },

    /// A task or workflow attempt exceeded its wall-clock budget
    #[error("{scope} {name} ({id}) timed out ({seconds}s)")]
    Timeout {
        scope: TimeoutScope,
        name: String,
        id: String,
        seconds: u64,
    },

    /// Control signal: the workflow paused at a named reference
    #[error("workflow paused at '{reference}'")]
    Paused { reference: String },

    /// Catalog miss
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Store miss
    #[error("execution context not found: {0}")]
    ContextNotFound(String),

    /// Secret manager miss
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// Store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Output storage failure
    #[error("output storage error: {0}")]
    OutputStorage(String),
}

impl EngineError {
    /// Whether this is the pause control signal rather than a fault
    pub fn is_pause(&self) -> bool {
        matches!(self, Self::Paused { .. })
    }

    /// Stable kind string used in persisted failure records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execution(_) => "execution",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::Paused { .. } => "paused",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::ContextNotFound(_) => "context_not_found",
            Self::SecretNotFound(_) => "secret_not_found",
            Self::Store(_) => "store",
            Self::Serialization(_) => "serialization",
            Self::OutputStorage(_) => "output_storage",
        }
    }
}

/// Persisted record of a failure, carried in `TASK_FAILED` / `WORKFLOW_FAILED`
///
/// Enough is kept to reconstruct an equivalent error on replay so that a
/// workflow which catches and branches on a failure takes the same path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Stable error kind (see [`EngineError::kind`])
    pub kind: String,

    /// Human-readable message
    pub message: String,

    /// Retry metadata, present when retries were involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<f64>,
}

impl FailureInfo {
    pub fn from_error(error: &EngineError) -> Self {
        match error {
            EngineError::RetryExhausted {
                cause,
                attempts,
                delay_secs,
                backoff,
            } => Self {
                kind: error.kind().to_string(),
                message: cause.clone(),
                attempts: Some(*attempts),
                delay_secs: Some(*delay_secs),
                backoff: Some(*backoff),
            },
            // Keep the inner message so reconstruction does not stack
            // another "execution failed:" prefix on every replay
            EngineError::Execution(message) => Self {
                kind: error.kind().to_string(),
                message: message.clone(),
                attempts: None,
                delay_secs: None,
                backoff: None,
            },
            other => Self {
                kind: other.kind().to_string(),
                message: other.to_string(),
                attempts: None,
                delay_secs: None,
                backoff: None,
            },
        }
    }

    /// Reconstruct an error equivalent to the one recorded
    pub fn to_error(&self) -> EngineError {
        match self.kind.as_str() {
            "retry_exhausted" => EngineError::RetryExhausted {
                cause: self.message.clone(),
                attempts: self.attempts.unwrap_or(0),
                delay_secs: self.delay_secs.unwrap_or(0),
                backoff: self.backoff.unwrap_or(1.0),
            },
            _ => EngineError::Execution(self.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_is_control_signal() {
        let err = EngineError::Paused {
            reference: "approval".to_string(),
        };
        assert!(err.is_pause());
        assert!(!EngineError::Execution("boom".to_string()).is_pause());
    }

    #[test]
    fn test_failure_info_round_trip_retry() {
        let err = EngineError::RetryExhausted {
            cause: "connection refused".to_string(),
            attempts: 3,
            delay_secs: 1,
            backoff: 2.0,
        };

        let info = FailureInfo::from_error(&err);
        assert_eq!(info.kind, "retry_exhausted");
        assert_eq!(info.attempts, Some(3));

        match info.to_error() {
            EngineError::RetryExhausted {
                attempts, backoff, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(backoff, 2.0);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_info_serialization() {
        let info = FailureInfo::from_error(&EngineError::Execution("boom".to_string()));
        let json = serde_json::to_string(&info).unwrap();
        // Optional retry metadata is omitted entirely when absent
        assert!(!json.contains("attempts"));

        let parsed: FailureInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, parsed);
    }

    #[test]
    fn test_timeout_display() {
        let err = EngineError::Timeout {
            scope: TimeoutScope::Task,
            name: "slow_task".to_string(),
            id: "slow_task_abc".to_string(),
            seconds: 3,
        };
        assert_eq!(err.to_string(), "Task slow_task (slow_task_abc) timed out (3s)");
    }
}
