//! Engine health and metrics aggregation.
//!
//! The coordinator reports execution and step transitions to an
//! [`EngineMonitor`]; health and metrics snapshots are derived on demand.
//! Health follows the failure rate over finished executions, and only
//! once at least `min_samples` have finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use orchestra_types::config::HealthThresholds;
use orchestra_types::execution::ExecutionStatus;
use orchestra_types::health::{EngineHealthStatus, EngineMetrics, HealthState};
use uuid::Uuid;

/// Lock-free counters shared by every execution of an engine.
#[derive(Debug)]
pub struct EngineMonitor {
    started: Instant,
    thresholds: HealthThresholds,
    dropped_events: Arc<AtomicU64>,
    /// Status of every live (non-terminal) execution.
    live: DashMap<Uuid, ExecutionStatus>,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    total_duration_ms: AtomicU64,
    steps_executed: AtomicU64,
    steps_failed: AtomicU64,
    steps_skipped: AtomicU64,
    retries: AtomicU64,
}

impl EngineMonitor {
    /// `dropped_events` is the emitter's shared counter.
    pub fn new(thresholds: HealthThresholds, dropped_events: Arc<AtomicU64>) -> Self {
        Self {
            started: Instant::now(),
            thresholds,
            dropped_events,
            live: DashMap::new(),
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            steps_executed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Track a status change. Terminal statuses move the execution from the
    /// live set into the finished counters.
    pub fn record_status(&self, execution_id: Uuid, status: ExecutionStatus, duration_ms: Option<u64>) {
        if !status.is_terminal() {
            if self.live.insert(execution_id, status).is_none() {
                self.total.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        if self.live.remove(&execution_id).is_none() {
            // Already finished (or never tracked).
            return;
        }
        let counter = match status {
            ExecutionStatus::Completed => &self.completed,
            ExecutionStatus::Failed => &self.failed,
            _ => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(ms) = duration_ms {
            self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        }
    }

    pub fn step_completed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_failed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_skipped(&self) {
        self.steps_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Live executions, optionally of a single status.
    pub fn live_count(&self, status: Option<ExecutionStatus>) -> u64 {
        self.live
            .iter()
            .filter(|entry| status.is_none_or(|s| *entry.value() == s))
            .count() as u64
    }

    pub fn metrics(&self, registered_workflows: u64) -> EngineMetrics {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        let finished = completed + failed + cancelled;

        let average_execution_ms = if finished == 0 {
            0.0
        } else {
            self.total_duration_ms.load(Ordering::Relaxed) as f64 / finished as f64
        };
        let success_rate = if finished == 0 {
            1.0
        } else {
            completed as f64 / finished as f64
        };

        EngineMetrics {
            total_executions: self.total.load(Ordering::Relaxed),
            running_executions: self.live_count(Some(ExecutionStatus::Running)),
            paused_executions: self.live_count(Some(ExecutionStatus::Paused)),
            completed_executions: completed,
            failed_executions: failed,
            cancelled_executions: cancelled,
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            steps_skipped: self.steps_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_execution_ms,
            success_rate,
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            registered_workflows,
        }
    }

    pub fn health(&self) -> EngineHealthStatus {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let samples = completed + failed;
        let failure_rate = if samples == 0 {
            0.0
        } else {
            failed as f64 / samples as f64
        };

        let state = if samples < self.thresholds.min_samples {
            HealthState::Healthy
        } else if failure_rate >= self.thresholds.unhealthy_failure_rate {
            HealthState::Unhealthy
        } else if failure_rate >= self.thresholds.degraded_failure_rate {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        EngineHealthStatus {
            state,
            active_executions: self.live_count(None),
            paused_executions: self.live_count(Some(ExecutionStatus::Paused)),
            failure_rate,
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
            checked_at: Utc::now(),
        }
    }
}
