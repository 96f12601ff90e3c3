//! Execution tracking types.
//!
//! A `WorkflowExecution` is one runtime instantiation of a definition. It owns
//! an ordered list of `StepExecution` records (one per dispatch round, loop
//! iteration, or skip), the orchestration context, and the append-only event log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::event::{AuditEntry, WorkflowEvent};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Execution lifecycle.
///
/// `pending -> running -> completed | failed`, `running <-> paused`, and any
/// non-terminal state may move to `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Failed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle: `pending -> running -> completed | failed | skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// One runtime instantiation of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Version of the definition snapshot this execution runs.
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub context: OrchestrationContext,
    /// Step records in creation order.
    #[serde(default)]
    pub steps: Vec<StepExecution>,
    /// Most recently dispatched step; only set while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    /// Append-only event log.
    #[serde(default)]
    pub events: Vec<WorkflowEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Every record for a step, oldest first.
    pub fn step_records<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepExecution> + 'a {
        self.steps.iter().filter(move |s| s.step_id == step_id)
    }

    /// The newest record for a step.
    pub fn latest_step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().rev().find(|s| s.step_id == step_id)
    }
}

/// Per-step execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    /// Attempts started for this record.
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Loop iteration this record belongs to, for loop body steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// 0 for the first round, 1 when the `retry` error strategy re-ran the step.
    #[serde(default)]
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepExecution {
    pub fn new(step_id: impl Into<String>, status: StepStatus, max_attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.into(),
            status,
            attempts: 0,
            max_attempts,
            input: None,
            output: None,
            error: None,
            iteration: None,
            round: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// Aggregate per-execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Orchestration context
// ---------------------------------------------------------------------------

/// Execution-scoped state visible to conditions, loops, and input mapping.
///
/// The engine reads `variables`, `step_outputs` and `step_history`; everything
/// else a caller stores in `variables` is opaque to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationContext {
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub step_outputs: HashMap<String, serde_json::Value>,
    /// Completed step ids in completion order.
    #[serde(default)]
    pub step_history: Vec<String>,
    #[serde(default)]
    pub audit_trail: Vec<AuditEntry>,
    #[serde(default)]
    pub security: SecurityContext,
}

/// Opaque caller identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Request / filter types
// ---------------------------------------------------------------------------

/// Per-call options for starting an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Initial context variables.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub security: SecurityContext,
    /// Overrides the definition and engine execution timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.workflow_id.is_none_or(|id| execution.workflow_id == id)
            && self.status.is_none_or(|s| execution.status == s)
    }
}
