//! Execution coordinator.
//!
//! Creates executions, hands each one to its own [`ExecutionRun`] task, and
//! serves the control operations (pause / resume / cancel) and queries that
//! act on live executions. Concurrency is bounded by semaphores:
//!
//! - engine-wide `max_active_executions`, when configured
//! - per-definition `concurrency`, keyed by workflow id
//!
//! Either limit being reached rejects the start with a conflict error rather
//! than queueing it. A per-definition semaphore is rebuilt when an update
//! changes the limit; executions admitted under the old limit keep their
//! permits until they finish.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use orchestra_types::config::EngineConfig;
use orchestra_types::error::WorkflowError;
use orchestra_types::event::{AuditEntry, WorkflowEvent, WorkflowEventType};
use orchestra_types::execution::{
    ExecuteOptions, ExecutionFilter, ExecutionMetrics, ExecutionStatus, OrchestrationContext,
    WorkflowExecution,
};
use orchestra_types::workflow::WorkflowDefinition;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::expression::ExpressionEvaluator;
use super::invoker::BoxAgentInvoker;
use super::run::{ExecutionRun, close_execution};
use crate::event::{EventEmitter, EventSubscription};
use crate::health::EngineMonitor;
use crate::repository::workflow::WorkflowRepository;

/// Replacement value for sensitive variables in audit entries.
pub(crate) const REDACTED: &str = "[redacted]";

/// Shared state of one live execution.
pub(crate) struct ExecutionSlot {
    pub(super) id: Uuid,
    /// Definition snapshot the execution runs against.
    pub(super) definition: Arc<WorkflowDefinition>,
    pub(super) execution: Mutex<WorkflowExecution>,
    /// Parent of every step token; fired on cancel, abort and timeout.
    pub(super) cancel: CancellationToken,
    /// Wakes the run loop after a control operation.
    pub(super) wake: Notify,
}

pub(crate) struct CoordinatorInner<R: WorkflowRepository> {
    pub(super) repo: Arc<R>,
    pub(super) invoker: Arc<BoxAgentInvoker>,
    pub(super) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(super) emitter: EventEmitter,
    pub(super) monitor: Arc<EngineMonitor>,
    pub(super) config: EngineConfig,
    pub(super) slots: DashMap<Uuid, Arc<ExecutionSlot>>,
    active_limit: Option<Arc<Semaphore>>,
    concurrency: DashMap<Uuid, DefinitionLimit>,
}

/// Per-definition concurrency semaphore and the limit it was built for.
struct DefinitionLimit {
    max: u32,
    semaphore: Arc<Semaphore>,
}

/// Runs workflow executions and controls the live ones.
pub struct ExecutionCoordinator<R: WorkflowRepository> {
    inner: Arc<CoordinatorInner<R>>,
}

impl<R: WorkflowRepository + 'static> ExecutionCoordinator<R> {
    pub fn new(
        repo: Arc<R>,
        invoker: BoxAgentInvoker,
        evaluator: Arc<dyn ExpressionEvaluator>,
        emitter: EventEmitter,
        monitor: Arc<EngineMonitor>,
        config: EngineConfig,
    ) -> Self {
        let active_limit = config
            .max_active_executions
            .map(|max| Arc::new(Semaphore::new(max)));
        Self {
            inner: Arc::new(CoordinatorInner {
                repo,
                invoker: Arc::new(invoker),
                evaluator,
                emitter,
                monitor,
                config,
                slots: DashMap::new(),
                active_limit,
                concurrency: DashMap::new(),
            }),
        }
    }

    /// Run an execution to a terminal status and return the final record.
    pub async fn execute(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let (slot, handle) = self.launch(definition, input, options).await?;
        handle
            .await
            .map_err(|e| WorkflowError::Internal(format!("execution task failed: {e}")))?;
        let execution = slot.execution.lock().await.clone();
        Ok(execution)
    }

    /// Start an execution in the background and return its id once the
    /// record exists.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<Uuid, WorkflowError> {
        let (slot, _handle) = self.launch(definition, input, options).await?;
        Ok(slot.id)
    }

    async fn launch(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<(Arc<ExecutionSlot>, JoinHandle<()>), WorkflowError> {
        let permits = self.admit(&definition)?;
        let timeout_ms = options
            .timeout_ms
            .or(definition.timeout_ms)
            .unwrap_or(self.inner.config.default_workflow_timeout_ms);
        let definition = Arc::new(definition);

        let mut execution = WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id: definition.id,
            workflow_version: definition.version.clone(),
            status: ExecutionStatus::Pending,
            input,
            output: None,
            context: OrchestrationContext {
                security: options.security,
                ..OrchestrationContext::default()
            },
            steps: Vec::new(),
            current_step: None,
            metrics: ExecutionMetrics::default(),
            events: Vec::new(),
            error: None,
            correlation_id: options.correlation_id,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let created = AuditEntry::new(execution.id, actor(&execution), "execution.create", "execution")
            .with_change(None, Some(json!(ExecutionStatus::Pending)));
        audit(&definition, &mut execution, created);

        let mut variables: Vec<(String, Value)> = options.variables.into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in variables {
            let entry = variable_entry(&definition, &execution, &key, None, value.clone());
            audit(&definition, &mut execution, entry);
            execution.context.variables.insert(key, value);
        }

        self.inner.repo.save_execution(&execution).await?;

        let id = execution.id;
        let slot = Arc::new(ExecutionSlot {
            id,
            definition: Arc::clone(&definition),
            execution: Mutex::new(execution),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
        });
        self.inner.emitter.open(id);
        self.inner.slots.insert(id, Arc::clone(&slot));
        self.inner.monitor.record_status(id, ExecutionStatus::Pending, None);

        tracing::debug!(
            execution_id = %id,
            workflow_id = %definition.id,
            timeout_ms,
            "execution created"
        );

        let run = ExecutionRun::new(Arc::clone(&self.inner), Arc::clone(&slot), timeout_ms, permits);
        let span = tracing::info_span!(
            "workflow_execution",
            execution_id = %id,
            workflow = %definition.name,
            version = %definition.version,
        );
        let handle = tokio::spawn(run.run().instrument(span));
        Ok((slot, handle))
    }

    /// Reserve capacity for one more execution of `definition`.
    fn admit(&self, definition: &WorkflowDefinition) -> Result<Vec<OwnedSemaphorePermit>, WorkflowError> {
        let mut permits = Vec::with_capacity(2);

        if let Some(limit) = &self.inner.active_limit {
            let permit = Arc::clone(limit).try_acquire_owned().map_err(|_| {
                WorkflowError::Conflict(format!(
                    "engine is at its limit of {} active executions",
                    self.inner.config.max_active_executions.unwrap_or_default()
                ))
            })?;
            permits.push(permit);
        }

        if let Some(max) = definition.concurrency {
            let semaphore = {
                let mut limit = self
                    .inner
                    .concurrency
                    .entry(definition.id)
                    .or_insert_with(|| DefinitionLimit {
                        max,
                        semaphore: Arc::new(Semaphore::new(max as usize)),
                    });
                if limit.max != max {
                    tracing::debug!(workflow_id = %definition.id, from = limit.max, to = max, "concurrency limit changed");
                    *limit = DefinitionLimit {
                        max,
                        semaphore: Arc::new(Semaphore::new(max as usize)),
                    };
                }
                Arc::clone(&limit.semaphore)
            };
            let permit = semaphore.try_acquire_owned().map_err(|_| {
                WorkflowError::Conflict(format!(
                    "workflow '{}' already has {max} active execution(s)",
                    definition.name
                ))
            })?;
            permits.push(permit);
        }

        Ok(permits)
    }

    /// Drop the concurrency state kept for a deleted definition.
    pub fn forget_definition(&self, workflow_id: &Uuid) {
        self.inner.concurrency.remove(workflow_id);
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    /// `running -> paused`. In-flight steps finish; nothing new is dispatched.
    pub async fn pause(&self, id: &Uuid) -> Result<(), WorkflowError> {
        let Some(slot) = self.slot(id) else {
            return self.not_live(id, "pause").await;
        };

        let mut exec = slot.execution.lock().await;
        if exec.status != ExecutionStatus::Running {
            return Err(WorkflowError::InvalidTransition {
                from: exec.status,
                action: "pause".to_string(),
            });
        }
        self.flip(&slot, &mut exec, ExecutionStatus::Paused);
        drop(exec);

        slot.wake.notify_one();
        tracing::info!(execution_id = %id, "execution paused");
        Ok(())
    }

    /// `paused -> running`.
    pub async fn resume(&self, id: &Uuid) -> Result<(), WorkflowError> {
        let Some(slot) = self.slot(id) else {
            return self.not_live(id, "resume").await;
        };

        let mut exec = slot.execution.lock().await;
        if exec.status != ExecutionStatus::Paused {
            return Err(WorkflowError::InvalidTransition {
                from: exec.status,
                action: "resume".to_string(),
            });
        }
        self.flip(&slot, &mut exec, ExecutionStatus::Running);
        drop(exec);

        slot.wake.notify_one();
        tracing::info!(execution_id = %id, "execution resumed");
        Ok(())
    }

    /// Cancel an execution. The status flips immediately; in-flight steps
    /// get the grace period to stop. Cancelling a cancelled execution is a
    /// no-op.
    pub async fn cancel(&self, id: &Uuid) -> Result<(), WorkflowError> {
        let Some(slot) = self.slot(id) else {
            return self.not_live(id, "cancel").await;
        };

        let mut exec = slot.execution.lock().await;
        match exec.status {
            ExecutionStatus::Cancelled => return Ok(()),
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                return Err(WorkflowError::InvalidTransition {
                    from: exec.status,
                    action: "cancel".to_string(),
                });
            }
            _ => {}
        }

        close_execution(&mut exec);
        self.flip(&slot, &mut exec, ExecutionStatus::Cancelled);
        drop(exec);

        slot.cancel.cancel();
        slot.wake.notify_one();
        tracing::info!(execution_id = %id, "execution cancelled");
        Ok(())
    }

    /// Apply a control transition under the execution lock.
    fn flip(&self, slot: &ExecutionSlot, exec: &mut WorkflowExecution, to: ExecutionStatus) {
        let from = exec.status;
        exec.status = to;
        exec.current_step = None;

        let event_type = match to {
            ExecutionStatus::Paused => WorkflowEventType::Paused,
            ExecutionStatus::Running => WorkflowEventType::Resumed,
            _ => WorkflowEventType::Cancelled,
        };
        let event = new_event(exec, event_type).with_data(json!({ "from": from }));
        self.inner.emitter.emit(exec, event);

        let action = match to {
            ExecutionStatus::Paused => "execution.pause",
            ExecutionStatus::Running => "execution.resume",
            _ => "execution.cancel",
        };
        let entry = transition_entry(exec, action, from, to);
        audit(&slot.definition, exec, entry);
        self.inner
            .monitor
            .record_status(exec.id, to, exec.metrics.duration_ms);
    }

    /// Answer a control operation on an execution that is not live.
    async fn not_live(&self, id: &Uuid, action: &str) -> Result<(), WorkflowError> {
        match self.inner.repo.get_execution(id).await? {
            Some(exec) if action == "cancel" && exec.status == ExecutionStatus::Cancelled => Ok(()),
            Some(exec) => Err(WorkflowError::InvalidTransition {
                from: exec.status,
                action: action.to_string(),
            }),
            None => Err(WorkflowError::ExecutionNotFound(*id)),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: &Uuid) -> Result<WorkflowExecution, WorkflowError> {
        if let Some(slot) = self.slot(id) {
            return Ok(slot.execution.lock().await.clone());
        }
        self.inner
            .repo
            .get_execution(id)
            .await?
            .ok_or(WorkflowError::ExecutionNotFound(*id))
    }

    /// Stored executions with live ones overlaid, newest first.
    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        let unpaged = ExecutionFilter {
            workflow_id: filter.workflow_id,
            ..ExecutionFilter::default()
        };
        let mut by_id: HashMap<Uuid, WorkflowExecution> = self
            .inner
            .repo
            .list_executions(&unpaged)
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        let live: Vec<Arc<ExecutionSlot>> = self
            .inner
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in live {
            let exec = slot.execution.lock().await.clone();
            by_id.insert(exec.id, exec);
        }

        let mut executions: Vec<WorkflowExecution> = by_id
            .into_values()
            .filter(|e| filter.matches(e))
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(executions
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Subscribe to an execution's events. The existing log is replayed
    /// first; live events follow until the execution finishes.
    pub async fn subscribe(&self, id: &Uuid) -> Result<EventSubscription, WorkflowError> {
        if let Some(slot) = self.slot(id) {
            // Emits happen under the same lock, so no event falls between
            // the backlog and the live receiver.
            let exec = slot.execution.lock().await;
            return Ok(self.inner.emitter.subscribe(*id, exec.events.clone()));
        }
        match self.inner.repo.get_execution(id).await? {
            Some(exec) => Ok(self.inner.emitter.subscribe(*id, exec.events)),
            None => Err(WorkflowError::ExecutionNotFound(*id)),
        }
    }

    pub fn unsubscribe(&self, subscription_id: &Uuid) -> bool {
        self.inner.emitter.unsubscribe(*subscription_id)
    }

    /// Number of executions with a live run task.
    pub fn live_executions(&self) -> usize {
        self.inner.slots.len()
    }

    fn slot(&self, id: &Uuid) -> Option<Arc<ExecutionSlot>> {
        self.inner.slots.get(id).map(|entry| Arc::clone(entry.value()))
    }
}

// ---------------------------------------------------------------------------
// Event and audit helpers
// ---------------------------------------------------------------------------

pub(super) fn new_event(exec: &WorkflowExecution, event_type: WorkflowEventType) -> WorkflowEvent {
    WorkflowEvent::new(exec.id, event_type).with_correlation(exec.correlation_id.clone())
}

/// Caller identity recorded on audit entries.
pub(super) fn actor(exec: &WorkflowExecution) -> String {
    exec.context
        .security
        .user_id
        .clone()
        .unwrap_or_else(|| "engine".to_string())
}

/// Append to the audit trail when the definition requires one.
pub(super) fn audit(definition: &WorkflowDefinition, exec: &mut WorkflowExecution, entry: AuditEntry) {
    if definition.compliance.audit_required {
        exec.context.audit_trail.push(entry);
    }
}

pub(super) fn transition_entry(
    exec: &WorkflowExecution,
    action: &str,
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> AuditEntry {
    AuditEntry::new(exec.id, actor(exec), action, "execution")
        .with_change(Some(json!(from)), Some(json!(to)))
}

pub(super) fn variable_entry(
    definition: &WorkflowDefinition,
    exec: &WorkflowExecution,
    key: &str,
    old: Option<Value>,
    new: Value,
) -> AuditEntry {
    let sensitive = definition
        .compliance
        .sensitive_fields
        .iter()
        .any(|field| field == key);
    let redact = |value: Value| if sensitive { json!(REDACTED) } else { value };
    AuditEntry::new(exec.id, actor(exec), "variable.set", format!("variables.{key}"))
        .with_change(old.map(redact), Some(redact(new)))
}
