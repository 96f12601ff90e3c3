//! Engine health and metrics snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall engine condition derived from recent execution outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealthStatus {
    pub state: HealthState,
    pub active_executions: u64,
    pub paused_executions: u64,
    /// Failed / (completed + failed) over finished executions.
    pub failure_rate: f64,
    pub dropped_events: u64,
    pub uptime_secs: u64,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub total_executions: u64,
    pub running_executions: u64,
    pub paused_executions: u64,
    pub completed_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    pub steps_executed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub retries: u64,
    pub average_execution_ms: f64,
    /// Completed / finished, 1.0 when nothing has finished yet.
    pub success_rate: f64,
    /// Events dropped from slow subscribers' queues.
    pub dropped_events: u64,
    pub registered_workflows: u64,
}
