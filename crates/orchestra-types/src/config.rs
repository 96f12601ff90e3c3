//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the engine's data
//! directory. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

use crate::workflow::BackoffKind;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step timeout used when a step sets none.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Execution timeout used when neither the definition nor the caller sets one.
    #[serde(default = "default_workflow_timeout_ms")]
    pub default_workflow_timeout_ms: u64,

    /// Backoff applied to steps that rely on the definition's `max_retries`.
    #[serde(default)]
    pub default_backoff: BackoffKind,

    #[serde(default = "default_initial_delay_ms")]
    pub default_initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub default_max_delay_ms: u64,

    /// Concurrent leaf steps per execution under parallel and hybrid strategies.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Engine-wide cap on live executions (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_executions: Option<usize>,

    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// How long cancellation waits for in-flight steps before abandoning them.
    #[serde(default = "default_cancellation_grace_ms")]
    pub cancellation_grace_ms: u64,

    #[serde(default)]
    pub delete_policy: DeletePolicy,

    /// Whether the `retry` error strategy may grant a failed step another round.
    #[serde(default = "default_allow_execution_retry")]
    pub allow_execution_retry: bool,

    #[serde(default)]
    pub health: HealthThresholds,
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_workflow_timeout_ms() -> u64 {
    1_800_000
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_concurrent_steps() -> usize {
    16
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_cancellation_grace_ms() -> u64 {
    5_000
}

fn default_allow_execution_retry() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: default_step_timeout_ms(),
            default_workflow_timeout_ms: default_workflow_timeout_ms(),
            default_backoff: BackoffKind::default(),
            default_initial_delay_ms: default_initial_delay_ms(),
            default_max_delay_ms: default_max_delay_ms(),
            max_concurrent_steps: default_max_concurrent_steps(),
            max_active_executions: None,
            subscriber_buffer: default_subscriber_buffer(),
            cancellation_grace_ms: default_cancellation_grace_ms(),
            delete_policy: DeletePolicy::default(),
            allow_execution_retry: default_allow_execution_retry(),
            health: HealthThresholds::default(),
        }
    }
}

/// What `delete` does when executions still reference the definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Reject with a conflict error.
    #[default]
    Block,
    /// Delete anyway and report a warning.
    AllowWithWarning,
}

/// Failure-rate thresholds for the health aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    #[serde(default = "default_degraded_failure_rate")]
    pub degraded_failure_rate: f64,
    #[serde(default = "default_unhealthy_failure_rate")]
    pub unhealthy_failure_rate: f64,
    /// Finished executions required before failure rate affects health.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

fn default_degraded_failure_rate() -> f64 {
    0.25
}

fn default_unhealthy_failure_rate() -> f64 {
    0.5
}

fn default_min_samples() -> u64 {
    5
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_failure_rate: default_degraded_failure_rate(),
            unhealthy_failure_rate: default_unhealthy_failure_rate(),
            min_samples: default_min_samples(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_timeout_ms, 300_000);
        assert_eq!(config.default_workflow_timeout_ms, 1_800_000);
        assert_eq!(config.max_concurrent_steps, 16);
        assert_eq!(config.subscriber_buffer, 256);
        assert_eq!(config.delete_policy, DeletePolicy::Block);
        assert!(config.allow_execution_retry);
        assert!(config.max_active_executions.is_none());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_toml_overrides() {
        let config: EngineConfig = toml::from_str(
            r#"
max_concurrent_steps = 4
delete_policy = "allow_with_warning"
default_backoff = "linear"

[health]
min_samples = 20
"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_steps, 4);
        assert_eq!(config.delete_policy, DeletePolicy::AllowWithWarning);
        assert_eq!(config.default_backoff, BackoffKind::Linear);
        assert_eq!(config.health.min_samples, 20);
        assert_eq!(config.health.degraded_failure_rate, 0.25);
        assert_eq!(config.cancellation_grace_ms, 5_000);
    }
}
