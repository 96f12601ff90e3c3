//! Workflow events and audit entries.
//!
//! Every state transition of an execution or one of its steps produces
//! exactly one `WorkflowEvent`. Events are immutable and appended to the
//! execution's log before being published to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of transition an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowEventType {
    Started,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetrying,
    Paused,
    Resumed,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowEventType {
    /// Terminal execution events; at most one is ever emitted per execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single entry in an execution's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub execution_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: WorkflowEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the event that led to this one (e.g. the matching `step-started`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Uuid>,
}

impl WorkflowEvent {
    pub fn new(execution_id: Uuid, event_type: WorkflowEventType) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            event_type,
            timestamp: Utc::now(),
            step_id: None,
            agent_id: None,
            message: None,
            data: None,
            correlation_id: None,
            caused_by: None,
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn caused_by(mut self, event_id: Option<Uuid>) -> Self {
        self.caused_by = event_id;
        self
    }
}

/// Compliance record of a state or variable change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub execution_id: Uuid,
    /// Caller user id, or "engine" for engine-initiated changes.
    pub actor: String,
    pub action: String,
    /// What changed (e.g. "execution", "step:fetch", "variables.api_key").
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
    pub success: bool,
}

impl AuditEntry {
    pub fn new(
        execution_id: Uuid,
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            execution_id,
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            old_value: None,
            new_value: None,
            success: true,
        }
    }

    pub fn with_change(
        mut self,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    /// Mark the audited action as unsuccessful.
    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}
