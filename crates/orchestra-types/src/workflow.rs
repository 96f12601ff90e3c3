//! Workflow definition types for Orchestra.
//!
//! `WorkflowDefinition` is the declarative, versioned description of a
//! workflow: its execution strategy, its steps (one tagged variant per step
//! kind), and the policies that apply when steps fail. Definitions are
//! immutable once an execution references them; executions hold a snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// YAML files and programmatic callers both produce this struct. The registry
/// validates it before it is ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned by the registry when left nil.
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    /// Human-readable workflow name (alphanumeric, hyphen, underscore).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// How top-level steps are released for dispatch.
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    /// Ordered list of steps. Declaration order is the scheduling tie-break.
    pub steps: Vec<WorkflowStep>,
    /// Trigger configurations. Stored and validated only; firing them is the
    /// caller's concern.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerConfig>,
    /// What happens once a step's retries are exhausted.
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Retry count applied to steps that carry no `retry_policy` of their own.
    #[serde(default)]
    pub max_retries: u32,
    /// Per-execution timeout in milliseconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Maximum concurrent executions of this definition (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Audit settings.
    #[serde(default)]
    pub compliance: ComplianceConfig,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// How the scheduler releases top-level steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One in-flight step at a time, in declaration order.
    #[default]
    Sequential,
    /// Every dependency-satisfied step at once, bounded by the engine's step limit.
    Parallel,
    /// Sequential release; steps whose dependencies were all skipped are skipped too.
    Conditional,
    /// Parallel release with the conditional skip cascade.
    Hybrid,
}

impl ExecutionStrategy {
    /// Whether top-level steps are released one at a time.
    pub fn is_serial(self) -> bool {
        matches!(self, Self::Sequential | Self::Conditional)
    }

    /// Whether a step whose dependencies were all skipped is itself skipped.
    pub fn cascades_skips(self) -> bool {
        matches!(self, Self::Conditional | Self::Hybrid)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step id (e.g. "fetch-orders"). Unique within a workflow.
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Step ids this step depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Retry configuration for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Tolerate an exhausted failure and let dependents proceed.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Step timeout in milliseconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional guard expression. A false guard skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Step-kind payload.
    pub config: StepConfig,
}

impl WorkflowStep {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }
}

/// The kind of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Agent,
    Condition,
    Loop,
    Parallel,
    Delay,
    Custom,
}

impl StepType {
    /// Container steps own other steps and never hold a worker slot.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Condition | Self::Loop | Self::Parallel)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Delay => "delay",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Step-specific payload.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: agent
///   agent: summarizer
///   input:
///     text: "{{ steps.fetch.output.body }}"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Invoke an agent through the agent invocation adapter.
    Agent {
        agent: String,
        /// Input mapping; string leaves may contain `{{ path }}` templates.
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Evaluate an expression and release one of two branches.
    Condition {
        expression: String,
        #[serde(default)]
        true_branch: Vec<String>,
        #[serde(default)]
        false_branch: Vec<String>,
    },
    /// Run the body steps once per item of a collection.
    Loop {
        /// Context path of the collection (e.g. "input.orders").
        collection: String,
        /// Variable name bound to the current item.
        #[serde(default = "default_item_variable")]
        item_variable: String,
        steps: Vec<String>,
        max_iterations: u32,
    },
    /// Run a group of steps concurrently.
    Parallel {
        steps: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<u32>,
        #[serde(default = "default_wait_for_all")]
        wait_for_all: bool,
    },
    /// Suspend this step (not the engine) for a fixed duration.
    Delay { duration_ms: u64 },
    /// Run a named handler through the agent invocation adapter.
    Custom {
        handler: String,
        #[serde(default)]
        input: serde_json::Value,
    },
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_wait_for_all() -> bool {
    true
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Agent { .. } => StepType::Agent,
            Self::Condition { .. } => StepType::Condition,
            Self::Loop { .. } => StepType::Loop,
            Self::Parallel { .. } => StepType::Parallel,
            Self::Delay { .. } => StepType::Delay,
            Self::Custom { .. } => StepType::Custom,
        }
    }

    /// Step ids owned by this step when it is a container.
    pub fn members(&self) -> Vec<&str> {
        match self {
            Self::Condition {
                true_branch,
                false_branch,
                ..
            } => true_branch
                .iter()
                .chain(false_branch.iter())
                .map(String::as_str)
                .collect(),
            Self::Loop { steps, .. } | Self::Parallel { steps, .. } => {
                steps.iter().map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry and error handling
// ---------------------------------------------------------------------------

/// Per-step retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (total attempts = max_retries + 1).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Optional cap on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `initial_delay * attempts`
    Linear,
    /// `initial_delay * 2^(attempts - 1)`
    #[default]
    Exponential,
}

/// Workflow-level failure policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub strategy: ErrorStrategy,
    /// Steps run in order when `strategy = compensate`. They never run otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation_steps: Vec<String>,
}

/// What the coordinator does once a step's retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Cancel in-flight work and fail the execution.
    #[default]
    FailFast,
    /// Record the failure and keep scheduling; the execution still ends failed.
    Continue,
    /// Grant the failed step one more full round of attempts.
    Retry,
    /// Stop scheduling, run the compensation steps, then fail.
    Compensate,
}

/// Compliance settings controlling the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceConfig {
    #[serde(default)]
    pub audit_required: bool,
    /// Variable names whose values are redacted in audit entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensitive_fields: Vec<String>,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// How a workflow is meant to be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Manual,
    Schedule { cron: String },
    Event { event: String },
    Webhook { path: String },
}

// ---------------------------------------------------------------------------
// Registry inputs
// ---------------------------------------------------------------------------

/// Partial update for a stored definition. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Explicit version. When absent the patch version is bumped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExecutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<WorkflowStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<TriggerConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<ComplianceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Filter for listing definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFilter {
    /// Case-insensitive substring match on the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExecutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl WorkflowFilter {
    pub fn matches(&self, def: &WorkflowDefinition) -> bool {
        if let Some(needle) = &self.name_contains {
            if !def.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(strategy) = self.strategy {
            if def.strategy != strategy {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_PIPELINE: &str = r#"
name: order-pipeline
version: "1.2.0"
strategy: hybrid
max_retries: 1
timeout_ms: 60000
error_handling:
  strategy: compensate
  compensation_steps: [refund]
triggers:
  - type: schedule
    cron: "0 * * * *"
steps:
  - id: fetch
    config:
      type: agent
      agent: fetcher
      input:
        source: "{{ input.source }}"
  - id: check
    depends_on: [fetch]
    config:
      type: condition
      expression: "steps.fetch.output.count > 0"
      true_branch: [process]
      false_branch: [notify]
  - id: process
    retry_policy:
      max_retries: 2
      backoff: linear
      initial_delay_ms: 100
    config:
      type: loop
      collection: steps.fetch.output.items
      steps: [handle]
      max_iterations: 10
  - id: handle
    config:
      type: custom
      handler: order-handler
  - id: notify
    continue_on_error: true
    config:
      type: delay
      duration_ms: 250
  - id: refund
    config:
      type: agent
      agent: refunder
"#;

    #[test]
    fn parse_yaml_definition() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_PIPELINE).unwrap();
        assert!(def.id.is_nil());
        assert_eq!(def.name, "order-pipeline");
        assert_eq!(def.strategy, ExecutionStrategy::Hybrid);
        assert_eq!(def.error_handling.strategy, ErrorStrategy::Compensate);
        assert_eq!(def.steps.len(), 6);
        assert_eq!(def.triggers.len(), 1);

        let process = def.step("process").unwrap();
        assert_eq!(process.step_type(), StepType::Loop);
        let policy = process.retry_policy.as_ref().unwrap();
        assert_eq!(policy.backoff, BackoffKind::Linear);
        assert_eq!(policy.initial_delay_ms, 100);

        match &process.config {
            StepConfig::Loop { item_variable, .. } => assert_eq!(item_variable, "item"),
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "name": "tiny",
            "steps": [{ "id": "a", "config": { "type": "delay", "duration_ms": 5 } }]
        }))
        .unwrap();
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.strategy, ExecutionStrategy::Sequential);
        assert_eq!(def.error_handling.strategy, ErrorStrategy::FailFast);
        assert!(!def.compliance.audit_required);
        assert!(!def.steps[0].continue_on_error);
    }

    #[test]
    fn parallel_defaults_to_wait_for_all() {
        let config: StepConfig = serde_json::from_value(serde_json::json!({
            "type": "parallel",
            "steps": ["a", "b"]
        }))
        .unwrap();
        match config {
            StepConfig::Parallel {
                wait_for_all,
                max_concurrency,
                ..
            } => {
                assert!(wait_for_all);
                assert!(max_concurrency.is_none());
            }
            other => panic!("expected parallel, got {other:?}"),
        }
    }

    #[test]
    fn condition_members_cover_both_branches() {
        let config = StepConfig::Condition {
            expression: "true".to_string(),
            true_branch: vec!["a".to_string()],
            false_branch: vec!["b".to_string(), "c".to_string()],
        };
        assert_eq!(config.members(), vec!["a", "b", "c"]);
        assert!(config.step_type().is_container());
    }

    #[test]
    fn strategy_release_matrix() {
        assert!(ExecutionStrategy::Sequential.is_serial());
        assert!(!ExecutionStrategy::Sequential.cascades_skips());
        assert!(ExecutionStrategy::Conditional.is_serial());
        assert!(ExecutionStrategy::Conditional.cascades_skips());
        assert!(!ExecutionStrategy::Parallel.is_serial());
        assert!(!ExecutionStrategy::Parallel.cascades_skips());
        assert!(!ExecutionStrategy::Hybrid.is_serial());
        assert!(ExecutionStrategy::Hybrid.cascades_skips());
    }

    #[test]
    fn filter_matches_name_and_strategy() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_PIPELINE).unwrap();
        let by_name = WorkflowFilter {
            name_contains: Some("ORDER".to_string()),
            ..Default::default()
        };
        assert!(by_name.matches(&def));

        let by_strategy = WorkflowFilter {
            strategy: Some(ExecutionStrategy::Sequential),
            ..Default::default()
        };
        assert!(!by_strategy.matches(&def));
    }
}
