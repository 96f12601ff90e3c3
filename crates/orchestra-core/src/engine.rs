//! Workflow engine facade.
//!
//! Wires the registry, coordinator, event emitter and health monitor around
//! one repository and one agent invoker, and exposes the engine API.

use std::sync::Arc;

use orchestra_types::config::EngineConfig;
use orchestra_types::error::WorkflowError;
use orchestra_types::execution::{ExecuteOptions, ExecutionFilter, WorkflowExecution};
use orchestra_types::health::{EngineHealthStatus, EngineMetrics};
use orchestra_types::workflow::{WorkflowDefinition, WorkflowFilter, WorkflowPatch};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{EventEmitter, EventSubscription};
use crate::health::EngineMonitor;
use crate::repository::workflow::WorkflowRepository;
use crate::workflow::coordinator::ExecutionCoordinator;
use crate::workflow::expression::{ExpressionEvaluator, JexlEvaluator};
use crate::workflow::invoker::BoxAgentInvoker;
use crate::workflow::registry::{DeleteOutcome, WorkflowRegistry};

/// The workflow orchestration engine.
///
/// Generic over the repository so orchestra-core never depends on
/// orchestra-infra. The agent invoker and expression evaluator are injected.
pub struct WorkflowEngine<R: WorkflowRepository> {
    registry: WorkflowRegistry<R>,
    coordinator: ExecutionCoordinator<R>,
    monitor: Arc<EngineMonitor>,
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    /// Engine with the JEXL expression evaluator.
    pub fn new(repo: R, invoker: BoxAgentInvoker, config: EngineConfig) -> Self {
        Self::with_evaluator(repo, invoker, Arc::new(JexlEvaluator::new()), config)
    }

    pub fn with_evaluator(
        repo: R,
        invoker: BoxAgentInvoker,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: EngineConfig,
    ) -> Self {
        let config = normalize_config(config);
        let repo = Arc::new(repo);
        let emitter = EventEmitter::new(config.subscriber_buffer);
        let monitor = Arc::new(EngineMonitor::new(
            config.health.clone(),
            emitter.dropped_counter(),
        ));

        tracing::info!(
            max_concurrent_steps = config.max_concurrent_steps,
            max_active_executions = config.max_active_executions,
            "workflow engine ready"
        );

        Self {
            registry: WorkflowRegistry::new(Arc::clone(&repo), config.delete_policy),
            coordinator: ExecutionCoordinator::new(
                repo,
                invoker,
                evaluator,
                emitter,
                Arc::clone(&monitor),
                config,
            ),
            monitor,
        }
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn create_workflow(&self, def: WorkflowDefinition) -> Result<WorkflowDefinition, WorkflowError> {
        self.registry.create(def).await
    }

    pub async fn update_workflow(
        &self,
        id: &Uuid,
        patch: WorkflowPatch,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        self.registry.update(id, patch).await
    }

    pub async fn delete_workflow(&self, id: &Uuid) -> Result<DeleteOutcome, WorkflowError> {
        let outcome = self.registry.delete(id).await?;
        if outcome.deleted {
            self.coordinator.forget_definition(id);
        }
        Ok(outcome)
    }

    pub async fn get_workflow(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.registry.get(id).await
    }

    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        self.registry.list(filter).await
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Run a stored workflow to completion.
    ///
    /// The execution runs against a snapshot of the definition taken here;
    /// later updates do not affect it.
    pub async fn execute_workflow(
        &self,
        workflow_id: &Uuid,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let def = self.registry.get(workflow_id).await?;
        self.coordinator.execute(def, input, options).await
    }

    /// Start a stored workflow and return the execution id immediately.
    pub async fn start_workflow(
        &self,
        workflow_id: &Uuid,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<Uuid, WorkflowError> {
        let def = self.registry.get(workflow_id).await?;
        self.coordinator.start(def, input, options).await
    }

    pub async fn pause_execution(&self, id: &Uuid) -> Result<(), WorkflowError> {
        self.coordinator.pause(id).await
    }

    pub async fn resume_execution(&self, id: &Uuid) -> Result<(), WorkflowError> {
        self.coordinator.resume(id).await
    }

    pub async fn cancel_execution(&self, id: &Uuid) -> Result<(), WorkflowError> {
        self.coordinator.cancel(id).await
    }

    pub async fn get_execution(&self, id: &Uuid) -> Result<WorkflowExecution, WorkflowError> {
        self.coordinator.get(id).await
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        self.coordinator.list(filter).await
    }

    pub async fn subscribe_to_execution(&self, id: &Uuid) -> Result<EventSubscription, WorkflowError> {
        self.coordinator.subscribe(id).await
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe_from_execution(&self, subscription_id: &Uuid) -> bool {
        self.coordinator.unsubscribe(subscription_id)
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    pub fn get_health_status(&self) -> EngineHealthStatus {
        self.monitor.health()
    }

    pub async fn get_metrics(&self) -> Result<EngineMetrics, WorkflowError> {
        let registered = self.registry.count().await?;
        Ok(self.monitor.metrics(registered))
    }
}

/// Raise zero-sized limits to 1 so the engine can make progress.
///
/// Applied to every config the engine is built with, however it was loaded.
pub fn normalize_config(mut config: EngineConfig) -> EngineConfig {
    if config.max_concurrent_steps == 0 {
        tracing::warn!("max_concurrent_steps = 0 would stall every execution, using 1");
        config.max_concurrent_steps = 1;
    }
    if config.subscriber_buffer == 0 {
        tracing::warn!("subscriber_buffer = 0 is not allowed, using 1");
        config.subscriber_buffer = 1;
    }
    if config.max_active_executions == Some(0) {
        tracing::warn!("max_active_executions = 0 would reject every start, using 1");
        config.max_active_executions = Some(1);
    }
    config
}
