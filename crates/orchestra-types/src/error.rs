use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::execution::ExecutionStatus;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. "steps[2].depends_on").
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced by the workflow engine.
///
/// Structural errors (`Validation`, `DependencyCycle`) reject the originating
/// call and never reach execution. Runtime errors are recorded on step and
/// execution records via [`ErrorInfo`].
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("validation failed: {}", join_field_errors(.errors))]
    Validation { errors: Vec<FieldError> },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("loop '{step_id}' exceeded max iterations ({max_iterations})")]
    LoopLimitExceeded { step_id: String, max_iterations: u32 },

    #[error("step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("{scope} timed out after {timeout_ms}ms")]
    Timeout { scope: String, timeout_ms: u64 },

    #[error("step '{step_id}' failed after {attempts} attempts: {message}")]
    RetryExhausted {
        step_id: String,
        attempts: u32,
        message: String,
    },

    #[error("cancelled: {0}")]
    Cancellation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("cannot {action} an execution that is {from}")]
    InvalidTransition {
        from: ExecutionStatus,
        action: String,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Build a validation error from a single field failure.
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![FieldError::new(field, message)],
        }
    }

    /// Stable machine-readable code carried in event data.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::DependencyCycle { .. } => "DEPENDENCY_CYCLE",
            Self::LoopLimitExceeded { .. } => "LOOP_LIMIT_EXCEEDED",
            Self::StepExecution { .. } => "STEP_EXECUTION_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::Cancellation(_) => "CANCELLED",
            Self::Conflict(_) => "CONFLICT",
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Repository(_) => "REPOSITORY_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The step this error is attributed to, when there is one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::LoopLimitExceeded { step_id, .. }
            | Self::StepExecution { step_id, .. }
            | Self::RetryExhausted { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
            step_id: self.step_id().map(str::to_string),
        }
    }
}

/// Serializable snapshot of an error, stored on step and execution records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ErrorInfo {
    /// Same error attributed to a specific step.
    pub fn for_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_field() {
        let err = WorkflowError::Validation {
            errors: vec![
                FieldError::new("name", "must not be empty"),
                FieldError::new("steps", "at least one step is required"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("name: must not be empty"));
        assert!(msg.contains("steps: at least one step is required"));
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn cycle_message_shows_path() {
        let err = WorkflowError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn to_info_carries_step_id() {
        let err = WorkflowError::LoopLimitExceeded {
            step_id: "each-order".into(),
            max_iterations: 3,
        };
        let info = err.to_info();
        assert_eq!(info.code, "LOOP_LIMIT_EXCEEDED");
        assert_eq!(info.step_id.as_deref(), Some("each-order"));
    }

    #[test]
    fn repository_error_converts() {
        let err: WorkflowError = RepositoryError::Query("disk full".into()).into();
        assert_eq!(err.code(), "REPOSITORY_ERROR");
        assert!(err.step_id().is_none());
    }

    #[test]
    fn invalid_transition_message() {
        let err = WorkflowError::InvalidTransition {
            from: ExecutionStatus::Completed,
            action: "pause".into(),
        };
        assert_eq!(err.to_string(), "cannot pause an execution that is completed");
    }
}
