//! The per-execution scheduling loop.
//!
//! One [`ExecutionRun`] task drives one execution from `pending` to a
//! terminal status:
//!
//! 1. Ask the [`StepScheduler`] for decisions and apply them until nothing
//!    moves (conditions, skips and container transitions settle inline).
//! 2. Leaf steps run as attempts on a `JoinSet`; the loop sleeps until an
//!    attempt reports back, a control operation wakes it, or the workflow
//!    deadline passes.
//! 3. Each outcome is recorded, retried per policy, or handed to the
//!    workflow's error strategy.
//! 4. When no step can move any more, the execution is finalized.
//!
//! All execution mutations happen under the slot's mutex, and events are
//! emitted under the same lock, so the event log order is the order in
//! which transitions happened. Only this task writes to the repository
//! while the execution is live.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orchestra_types::error::{ErrorInfo, WorkflowError};
use orchestra_types::event::{AuditEntry, WorkflowEventType};
use orchestra_types::execution::{ExecutionStatus, StepExecution, StepStatus, WorkflowExecution};
use orchestra_types::workflow::{ErrorStrategy, StepConfig, WorkflowDefinition, WorkflowStep};
use serde_json::{Map, Value, json};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::context::{cap_output, expression_context, lookup_path, resolve_input};
use super::coordinator::{
    CoordinatorInner, ExecutionSlot, actor, audit, new_event, transition_entry, variable_entry,
};
use super::invoker::{InvocationKind, InvocationRequest};
use super::retry::{RetryDecision, RetryEvaluator};
use super::scheduler::{ScheduleDecision, SchedulerState, SkipReason, StepScheduler};
use super::step_runner::{AttemptJob, AttemptOutcome, StepAction, run_attempt};
use crate::repository::workflow::WorkflowRepository;

/// Iteration state of a running loop step.
#[derive(Debug)]
struct LoopProgress {
    items: Vec<Value>,
    index: usize,
    results: Vec<Value>,
}

enum Wake {
    Attempt(Option<Result<AttemptOutcome, tokio::task::JoinError>>),
    Signal,
    Deadline,
}

pub(crate) struct ExecutionRun<R: WorkflowRepository> {
    inner: Arc<CoordinatorInner<R>>,
    slot: Arc<ExecutionSlot>,
    definition: Arc<WorkflowDefinition>,
    scheduler: StepScheduler,
    state: SchedulerState,
    tasks: JoinSet<AttemptOutcome>,
    /// Index into `execution.steps` of each step's current record.
    records: HashMap<String, usize>,
    actions: HashMap<String, StepAction>,
    started_events: HashMap<String, uuid::Uuid>,
    step_tokens: HashMap<String, CancellationToken>,
    loops: HashMap<String, LoopProgress>,
    /// Steps already granted a second round by the `retry` strategy.
    retried: HashSet<String>,
    /// Members cut off by an early-completing parallel group.
    abandoned: HashSet<String>,
    /// First failure that makes the execution end `failed`.
    failure: Option<ErrorInfo>,
    abort: Option<ErrorInfo>,
    /// Remaining compensation steps, once compensation has started.
    compensation: Option<VecDeque<String>>,
    deadline: Instant,
    timeout_ms: u64,
    _permits: Vec<OwnedSemaphorePermit>,
}

impl<R: WorkflowRepository + 'static> ExecutionRun<R> {
    pub(crate) fn new(
        inner: Arc<CoordinatorInner<R>>,
        slot: Arc<ExecutionSlot>,
        timeout_ms: u64,
        permits: Vec<OwnedSemaphorePermit>,
    ) -> Self {
        let definition = Arc::clone(&slot.definition);
        let scheduler = StepScheduler::new(Arc::clone(&definition), inner.config.max_concurrent_steps);
        Self {
            inner,
            slot,
            definition,
            scheduler,
            state: SchedulerState::default(),
            tasks: JoinSet::new(),
            records: HashMap::new(),
            actions: HashMap::new(),
            started_events: HashMap::new(),
            step_tokens: HashMap::new(),
            loops: HashMap::new(),
            retried: HashSet::new(),
            abandoned: HashSet::new(),
            failure: None,
            abort: None,
            compensation: None,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
            timeout_ms,
            _permits: permits,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(error) = self.drive().await {
            tracing::error!(
                execution_id = %self.slot.id,
                error = %error,
                "execution stopped by engine error"
            );
            self.abort_with(error.to_info()).await;
        }
        self.finish().await;
    }

    async fn drive(&mut self) -> Result<(), WorkflowError> {
        if !self.begin().await {
            self.wind_down().await;
            return Ok(());
        }

        loop {
            let status = self.slot.execution.lock().await.status;
            if status == ExecutionStatus::Cancelled {
                self.wind_down().await;
                return Ok(());
            }
            if let Some(info) = self.abort.take() {
                self.abort_with(info).await;
                return Ok(());
            }

            if status == ExecutionStatus::Running {
                self.pump().await;
                if self.abort.is_some() {
                    continue;
                }
                if self.tasks.is_empty() {
                    if self.settled() {
                        self.finalize().await;
                        return Ok(());
                    }
                    return Err(WorkflowError::Internal(
                        "execution stalled: steps remain but none can run".to_string(),
                    ));
                }
            }

            self.checkpoint().await?;

            let wake = tokio::select! {
                joined = self.tasks.join_next(), if !self.tasks.is_empty() => Wake::Attempt(joined),
                () = self.slot.wake.notified() => Wake::Signal,
                () = tokio::time::sleep_until(self.deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Attempt(Some(joined)) => {
                    let outcome = joined
                        .map_err(|e| WorkflowError::Internal(format!("step task failed: {e}")))?;
                    self.on_outcome(outcome).await;
                }
                Wake::Attempt(None) | Wake::Signal => {}
                Wake::Deadline => {
                    tracing::warn!(
                        execution_id = %self.slot.id,
                        timeout_ms = self.timeout_ms,
                        "workflow timed out"
                    );
                    self.abort.get_or_insert(
                        WorkflowError::Timeout {
                            scope: "workflow".to_string(),
                            timeout_ms: self.timeout_ms,
                        }
                        .to_info(),
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// `pending -> running`. Returns false if the execution was cancelled
    /// before it started.
    async fn begin(&mut self) -> bool {
        let slot = Arc::clone(&self.slot);
        let mut exec = slot.execution.lock().await;
        if exec.status != ExecutionStatus::Pending {
            return false;
        }

        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(Utc::now());
        let event = new_event(&exec, WorkflowEventType::Started).with_data(json!({
            "workflow_id": self.definition.id,
            "workflow_version": self.definition.version,
        }));
        self.inner.emitter.emit(&mut exec, event);
        let entry = transition_entry(&exec, "execution.start", ExecutionStatus::Pending, ExecutionStatus::Running);
        audit(&self.definition, &mut exec, entry);
        self.inner.monitor.record_status(exec.id, ExecutionStatus::Running, None);

        tracing::info!(
            execution_id = %exec.id,
            workflow = %self.definition.name,
            strategy = ?self.definition.strategy,
            "execution started"
        );
        true
    }

    /// Every step has reached a terminal status (or compensation is done).
    fn settled(&self) -> bool {
        match &self.compensation {
            Some(queue) => queue.is_empty(),
            None => self.scheduler.unfinished(&self.state).next().is_none(),
        }
    }

    async fn finalize(&mut self) {
        let slot = Arc::clone(&self.slot);
        let mut exec = slot.execution.lock().await;
        if exec.status != ExecutionStatus::Running {
            return;
        }

        if self.compensation.is_none() {
            let definition = Arc::clone(&self.definition);
            for step_id in &definition.error_handling.compensation_steps {
                if !self.records.contains_key(step_id) {
                    self.skip(&mut exec, step_id, &SkipReason::CompensationNotNeeded);
                }
            }
        }

        // Compensation can end the run while a group or loop is still open.
        let definition = Arc::clone(&self.definition);
        for step in &definition.steps {
            if self.state.status(&step.id) == Some(StepStatus::Running) {
                self.interrupt(&mut exec, &step.id, "compensation ended the execution");
            }
        }

        close_execution(&mut exec);
        match self.failure.clone() {
            Some(info) => {
                exec.status = ExecutionStatus::Failed;
                self.emit_failed(&mut exec, info, ExecutionStatus::Running);
            }
            None => {
                exec.status = ExecutionStatus::Completed;
                let output: Map<String, Value> = exec
                    .context
                    .step_outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                exec.output = Some(Value::Object(output));
                let event = new_event(&exec, WorkflowEventType::Completed)
                    .with_data(json!({ "duration_ms": exec.metrics.duration_ms }));
                self.inner.emitter.emit(&mut exec, event);
                let entry = transition_entry(&exec, "execution.complete", ExecutionStatus::Running, ExecutionStatus::Completed);
                audit(&self.definition, &mut exec, entry);
            }
        }

        tracing::info!(
            execution_id = %exec.id,
            status = %exec.status,
            duration_ms = exec.metrics.duration_ms,
            "execution finished"
        );
    }

    /// Stop everything and fail the execution with `info`.
    async fn abort_with(&mut self, info: ErrorInfo) {
        self.slot.cancel.cancel();
        self.drain().await;

        let slot = Arc::clone(&self.slot);
        let mut exec = slot.execution.lock().await;
        fail_running_records(&mut exec, "execution aborted");
        if exec.status.is_terminal() {
            return;
        }
        let from = exec.status;

        tracing::warn!(
            execution_id = %exec.id,
            code = %info.code,
            step_id = info.step_id.as_deref(),
            "execution failed"
        );
        close_execution(&mut exec);
        exec.status = ExecutionStatus::Failed;
        self.emit_failed(&mut exec, info, from);
    }

    /// Cancellation already flipped the status; stop in-flight work quietly.
    async fn wind_down(&mut self) {
        self.slot.cancel.cancel();
        self.drain().await;
        let slot = Arc::clone(&self.slot);
        let mut exec = slot.execution.lock().await;
        fail_running_records(&mut exec, "execution cancelled");
    }

    /// Wait up to the grace period for in-flight attempts, recording their
    /// results without side effects, then abandon the rest.
    async fn drain(&mut self) {
        let deadline = Instant::now() + Duration::from_millis(self.inner.config.cancellation_grace_ms);
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    let slot = Arc::clone(&self.slot);
                    let mut exec = slot.execution.lock().await;
                    self.record_quietly(&mut exec, outcome);
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(execution_id = %self.slot.id, error = %e, "step task failed during shutdown");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        execution_id = %self.slot.id,
                        abandoned = self.tasks.len(),
                        "grace period elapsed, abandoning in-flight steps"
                    );
                    self.tasks.abort_all();
                    break;
                }
            }
        }
    }

    async fn finish(self) {
        let id = self.slot.id;
        let snapshot = {
            let exec = self.slot.execution.lock().await;
            self.inner
                .monitor
                .record_status(id, exec.status, exec.metrics.duration_ms);
            exec.clone()
        };

        if let Err(e) = self.inner.repo.save_execution(&snapshot).await {
            tracing::error!(execution_id = %id, error = %e, "failed to persist final execution state");
        }
        self.inner.emitter.close(id);
        self.inner.slots.remove(&id);
    }

    async fn checkpoint(&self) -> Result<(), WorkflowError> {
        let snapshot = self.slot.execution.lock().await.clone();
        self.inner.repo.save_execution(&snapshot).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Apply scheduler decisions until nothing moves, or dispatch the next
    /// compensation step.
    async fn pump(&mut self) {
        let slot = Arc::clone(&self.slot);
        let mut exec = slot.execution.lock().await;
        if exec.status != ExecutionStatus::Running {
            return;
        }

        if self.compensation.is_none() {
            'settle: loop {
                let decisions = self.scheduler.next(&self.state);
                if decisions.is_empty() {
                    break;
                }
                for decision in decisions {
                    if self.abort.is_some() || self.compensation.is_some() {
                        break 'settle;
                    }
                    tracing::debug!(execution_id = %exec.id, ?decision, "schedule");
                    match decision {
                        ScheduleDecision::Dispatch(step_id) => self.dispatch(&mut exec, &step_id),
                        ScheduleDecision::Skip { step_id, reason } => {
                            self.skip(&mut exec, &step_id, &reason)
                        }
                        ScheduleDecision::CompleteGroup(step_id) => {
                            self.complete_group(&mut exec, &step_id)
                        }
                        ScheduleDecision::FinishIteration(step_id) => {
                            self.finish_iteration(&mut exec, &step_id)
                        }
                    }
                }
            }
        }

        // Compensation steps run one at a time once in-flight work is done.
        while self.abort.is_none() && self.tasks.is_empty() {
            let Some(step_id) = self.compensation.as_mut().and_then(VecDeque::pop_front) else {
                break;
            };
            self.dispatch(&mut exec, &step_id);
        }
    }

    fn dispatch(&mut self, exec: &mut WorkflowExecution, step_id: &str) {
        let definition = Arc::clone(&self.definition);
        let Some(step) = definition.step(step_id) else {
            self.abort
                .get_or_insert(WorkflowError::Internal(format!("unknown step '{step_id}'")).to_info());
            return;
        };

        if let Some(guard) = &step.when {
            let context = expression_context(exec);
            match self.inner.evaluator.evaluate(guard, &context) {
                Ok(true) => {}
                Ok(false) => {
                    self.skip(exec, step_id, &SkipReason::GuardFalse);
                    return;
                }
                Err(e) => {
                    self.open_record(exec, step, 1);
                    let error = WorkflowError::StepExecution {
                        step_id: step_id.to_string(),
                        message: format!("guard evaluation failed: {e}"),
                    };
                    self.fail_step(exec, step, error);
                    return;
                }
            }
        }

        match &step.config {
            StepConfig::Condition { expression, .. } => self.run_condition(exec, step, expression),
            StepConfig::Parallel { .. } => {
                self.open_record(exec, step, 1);
            }
            StepConfig::Loop { .. } => self.start_loop(exec, step),
            StepConfig::Agent { agent, input } => {
                let request = self.request(exec, step, InvocationKind::Agent, agent, input);
                self.start_leaf(exec, step, StepAction::Invoke(request));
            }
            StepConfig::Custom { handler, input } => {
                let request = self.request(exec, step, InvocationKind::Custom, handler, input);
                self.start_leaf(exec, step, StepAction::Invoke(request));
            }
            StepConfig::Delay { duration_ms } => {
                self.start_leaf(exec, step, StepAction::Delay(Duration::from_millis(*duration_ms)));
            }
        }
    }

    fn request(
        &self,
        exec: &WorkflowExecution,
        step: &WorkflowStep,
        kind: InvocationKind,
        target: &str,
        input: &Value,
    ) -> InvocationRequest {
        let context = expression_context(exec);
        InvocationRequest {
            execution_id: exec.id,
            step_id: step.id.clone(),
            kind,
            target: target.to_string(),
            input: resolve_input(input, &context),
            context,
            attempt: 1,
        }
    }

    fn start_leaf(&mut self, exec: &mut WorkflowExecution, step: &WorkflowStep, action: StepAction) {
        let policy = RetryEvaluator::effective_policy(step, &self.definition, &self.inner.config);
        let index = self.open_record(exec, step, RetryEvaluator::max_attempts(&policy));
        exec.steps[index].input = Some(action.input_snapshot());
        exec.current_step = Some(step.id.clone());
        self.actions.insert(step.id.clone(), action);
        self.spawn_attempt(step, 1, Duration::ZERO);
    }

    fn spawn_attempt(&mut self, step: &WorkflowStep, attempt: u32, backoff: Duration) {
        let Some(action) = self.actions.get(&step.id).cloned() else {
            return;
        };
        let cancel = self
            .step_tokens
            .entry(step.id.clone())
            .or_insert_with(|| self.slot.cancel.child_token())
            .clone();
        let timeout = Duration::from_millis(
            step.timeout_ms
                .unwrap_or(self.inner.config.default_step_timeout_ms),
        );

        let span = tracing::debug_span!("step_attempt", step_id = %step.id, attempt);
        self.tasks.spawn(
            run_attempt(AttemptJob {
                invoker: Arc::clone(&self.inner.invoker),
                step_id: step.id.clone(),
                attempt,
                backoff,
                timeout,
                action: action.for_attempt(attempt),
                cancel,
            })
            .instrument(span),
        );
    }

    fn run_condition(&mut self, exec: &mut WorkflowExecution, step: &WorkflowStep, expression: &str) {
        self.open_record(exec, step, 1);
        let context = expression_context(exec);
        match self.inner.evaluator.evaluate(expression, &context) {
            Ok(taken) => {
                tracing::debug!(execution_id = %exec.id, step_id = %step.id, taken, "condition evaluated");
                self.state.branches.insert(step.id.clone(), taken);
                self.complete_step(exec, &step.id, json!({ "result": taken }), None);
            }
            Err(e) => {
                let error = WorkflowError::StepExecution {
                    step_id: step.id.clone(),
                    message: format!("condition evaluation failed: {e}"),
                };
                self.fail_step(exec, step, error);
            }
        }
    }

    fn start_loop(&mut self, exec: &mut WorkflowExecution, step: &WorkflowStep) {
        let StepConfig::Loop {
            collection,
            item_variable,
            max_iterations,
            ..
        } = &step.config
        else {
            return;
        };

        self.open_record(exec, step, 1);
        let context = expression_context(exec);
        let items = match lookup_path(&context, collection) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                let error = WorkflowError::StepExecution {
                    step_id: step.id.clone(),
                    message: format!("loop collection '{collection}' is not an array: {other}"),
                };
                self.fail_step(exec, step, error);
                return;
            }
            None => {
                let error = WorkflowError::StepExecution {
                    step_id: step.id.clone(),
                    message: format!("loop collection '{collection}' not found"),
                };
                self.fail_step(exec, step, error);
                return;
            }
        };

        if items.is_empty() {
            self.complete_step(exec, &step.id, json!({ "iterations": 0, "results": [] }), None);
            return;
        }
        if *max_iterations == 0 {
            let error = WorkflowError::LoopLimitExceeded {
                step_id: step.id.clone(),
                max_iterations: 0,
            };
            self.fail_step(exec, step, error);
            return;
        }

        self.loops.insert(
            step.id.clone(),
            LoopProgress {
                items,
                index: 0,
                results: Vec::new(),
            },
        );
        self.bind_item(exec, &step.id, item_variable);
    }

    /// Expose the current loop item to the body.
    fn bind_item(&mut self, exec: &mut WorkflowExecution, loop_id: &str, item_variable: &str) {
        let Some(progress) = self.loops.get(loop_id) else {
            return;
        };
        let item = progress.items.get(progress.index).cloned().unwrap_or(Value::Null);
        let index = progress.index;
        self.set_variable(exec, item_variable, item);
        self.set_variable(exec, &format!("{item_variable}_index"), json!(index));
    }

    fn set_variable(&self, exec: &mut WorkflowExecution, key: &str, value: Value) {
        let old = exec.context.variables.insert(key.to_string(), value.clone());
        let entry = variable_entry(&self.definition, exec, key, old, value);
        audit(&self.definition, exec, entry);
    }

    fn finish_iteration(&mut self, exec: &mut WorkflowExecution, loop_id: &str) {
        let definition = Arc::clone(&self.definition);
        let Some(step) = definition.step(loop_id) else {
            return;
        };
        let StepConfig::Loop {
            item_variable,
            max_iterations,
            ..
        } = &step.config
        else {
            return;
        };

        let body = self.scheduler.descendants(loop_id).to_vec();
        let snapshot: Map<String, Value> = body
            .iter()
            .filter_map(|id| {
                exec.context
                    .step_outputs
                    .get(id)
                    .map(|output| (id.clone(), output.clone()))
            })
            .collect();

        let Some(progress) = self.loops.get_mut(loop_id) else {
            return;
        };
        progress.results.push(Value::Object(snapshot));
        let next = progress.index + 1;

        if next >= progress.items.len() {
            let results = std::mem::take(&mut progress.results);
            self.loops.remove(loop_id);
            let output = json!({ "iterations": results.len(), "results": results });
            self.complete_step(exec, loop_id, output, None);
            return;
        }
        if next >= *max_iterations as usize {
            self.loops.remove(loop_id);
            let error = WorkflowError::LoopLimitExceeded {
                step_id: loop_id.to_string(),
                max_iterations: *max_iterations,
            };
            self.fail_step(exec, step, error);
            return;
        }
        progress.index = next;

        tracing::debug!(execution_id = %exec.id, step_id = loop_id, iteration = next, "next loop iteration");
        self.reset_steps(exec, &body);
        self.bind_item(exec, loop_id, item_variable);
    }

    /// Forget run state for `ids` so the scheduler treats them as never run.
    /// Their earlier records stay in the execution history.
    fn reset_steps(&mut self, exec: &mut WorkflowExecution, ids: &[String]) {
        for id in ids {
            if self.state.status(id) == Some(StepStatus::Running) {
                self.abandoned.insert(id.clone());
            }
            if let Some(token) = self.step_tokens.remove(id) {
                token.cancel();
            }
            self.actions.remove(id);
            self.state.statuses.remove(id);
            self.state.tolerated.remove(id);
            self.state.branches.remove(id);
            self.records.remove(id);
            self.retried.remove(id);
            self.loops.remove(id);
            self.started_events.remove(id);
            exec.context.step_outputs.remove(id);
        }
    }

    fn complete_group(&mut self, exec: &mut WorkflowExecution, group_id: &str) {
        let definition = Arc::clone(&self.definition);
        let Some(StepConfig::Parallel { steps: members, .. }) = definition.step(group_id).map(|s| &s.config) else {
            return;
        };

        // Members still running when a first-completion group closes.
        for id in self.scheduler.descendants(group_id).to_vec() {
            if self.state.status(&id) != Some(StepStatus::Running) {
                continue;
            }
            if let Some(token) = self.step_tokens.remove(&id) {
                token.cancel();
            }
            self.abandoned.insert(id.clone());
            self.actions.remove(&id);
            self.skip(
                exec,
                &id,
                &SkipReason::ContainerFinished {
                    container: group_id.to_string(),
                },
            );
        }

        let output: Map<String, Value> = members
            .iter()
            .filter_map(|id| {
                exec.context
                    .step_outputs
                    .get(id)
                    .map(|output| (id.clone(), output.clone()))
            })
            .collect();
        self.complete_step(exec, group_id, Value::Object(output), None);
    }

    // -----------------------------------------------------------------------
    // Step records and events
    // -----------------------------------------------------------------------

    /// Start a new `running` record and emit `step-started`.
    fn open_record(&mut self, exec: &mut WorkflowExecution, step: &WorkflowStep, max_attempts: u32) -> usize {
        let mut record = StepExecution::new(&step.id, StepStatus::Running, max_attempts);
        record.attempts = 1;
        record.started_at = Some(Utc::now());
        record.iteration = self.iteration_of(&step.id);
        record.round = u32::from(self.retried.contains(&step.id));
        exec.steps.push(record);
        let index = exec.steps.len() - 1;
        self.records.insert(step.id.clone(), index);
        self.state.statuses.insert(step.id.clone(), StepStatus::Running);

        let mut event = new_event(exec, WorkflowEventType::StepStarted)
            .with_step(&step.id)
            .with_data(json!({ "type": step.step_type().to_string(), "max_attempts": max_attempts }));
        if let StepConfig::Agent { agent, .. } = &step.config {
            event = event.with_agent(agent);
        }
        self.started_events.insert(step.id.clone(), event.id);
        self.inner.emitter.emit(exec, event);
        index
    }

    fn iteration_of(&self, step_id: &str) -> Option<u32> {
        let loop_id = self.scheduler.enclosing_loop(step_id)?;
        self.loops.get(loop_id).map(|p| p.index as u32)
    }

    fn complete_step(&mut self, exec: &mut WorkflowExecution, step_id: &str, output: Value, elapsed_ms: Option<u64>) {
        let output = cap_output(step_id, output);
        let now = Utc::now();
        let mut attempts = 1;
        if let Some(record) = record_mut(&self.records, exec, step_id) {
            record.status = StepStatus::Completed;
            record.output = Some(output.clone());
            record.completed_at = Some(now);
            record.duration_ms = elapsed_ms.or_else(|| {
                record
                    .started_at
                    .map(|s| (now - s).num_milliseconds().max(0) as u64)
            });
            attempts = record.attempts;
        }

        exec.context.step_outputs.insert(step_id.to_string(), output);
        exec.context.step_history.push(step_id.to_string());
        exec.metrics.steps_completed += 1;
        self.inner.monitor.step_completed();
        self.state.statuses.insert(step_id.to_string(), StepStatus::Completed);
        self.release(exec, step_id);

        let event = new_event(exec, WorkflowEventType::StepCompleted)
            .with_step(step_id)
            .caused_by(self.started_events.get(step_id).copied())
            .with_data(json!({ "attempts": attempts, "duration_ms": elapsed_ms }));
        self.inner.emitter.emit(exec, event);
        let entry = step_entry(exec, step_id, StepStatus::Completed);
        audit(&self.definition, exec, entry);
        tracing::debug!(execution_id = %exec.id, step_id, attempts, "step completed");
    }

    /// Record a skip. Reuses a running record (abandoned group member) or
    /// creates a new one.
    fn skip(&mut self, exec: &mut WorkflowExecution, step_id: &str, reason: &SkipReason) {
        let now = Utc::now();
        match record_mut(&self.records, exec, step_id) {
            Some(record) if record.status == StepStatus::Running => {
                record.status = StepStatus::Skipped;
                record.completed_at = Some(now);
            }
            _ => {
                let mut record = StepExecution::new(step_id, StepStatus::Skipped, 1);
                record.completed_at = Some(now);
                record.iteration = self.iteration_of(step_id);
                record.round = u32::from(self.retried.contains(step_id));
                exec.steps.push(record);
                self.records.insert(step_id.to_string(), exec.steps.len() - 1);
            }
        }

        exec.metrics.steps_skipped += 1;
        self.inner.monitor.step_skipped();
        self.state.statuses.insert(step_id.to_string(), StepStatus::Skipped);
        self.release(exec, step_id);

        // Members of a skipped container never get a record or event of
        // their own; the container's skip covers them.
        for member in self.scheduler.descendants(step_id) {
            self.state
                .statuses
                .entry(member.clone())
                .or_insert(StepStatus::Skipped);
        }

        let event = new_event(exec, WorkflowEventType::StepSkipped)
            .with_step(step_id)
            .with_message(reason.to_string())
            .caused_by(self.started_events.get(step_id).copied());
        self.inner.emitter.emit(exec, event);
        let entry = step_entry(exec, step_id, StepStatus::Skipped);
        audit(&self.definition, exec, entry);
        tracing::debug!(execution_id = %exec.id, step_id, %reason, "step skipped");
    }

    /// Record a permanent step failure, then apply `continue_on_error` or the
    /// workflow's error strategy.
    fn fail_step(&mut self, exec: &mut WorkflowExecution, step: &WorkflowStep, error: WorkflowError) {
        let info = self.record_failure(exec, &step.id, &error);

        if self.compensation.is_some() {
            tracing::warn!(execution_id = %exec.id, step_id = %step.id, error = %error, "step failed during compensation");
            return;
        }
        if step.continue_on_error {
            tracing::warn!(execution_id = %exec.id, step_id = %step.id, error = %error, "step failed, continuing");
            self.state.tolerated.insert(step.id.clone());
            return;
        }

        match self.definition.error_handling.strategy {
            ErrorStrategy::FailFast => {
                self.abort.get_or_insert(info);
            }
            ErrorStrategy::Continue => {
                tracing::warn!(execution_id = %exec.id, step_id = %step.id, error = %error, "step failed, continuing past it");
                self.state.tolerated.insert(step.id.clone());
                self.failure.get_or_insert(info);
            }
            ErrorStrategy::Retry => {
                if self.inner.config.allow_execution_retry && !self.retried.contains(&step.id) {
                    tracing::info!(execution_id = %exec.id, step_id = %step.id, "granting failed step another round");
                    // A container's members run again with it.
                    let mut round = vec![step.id.clone()];
                    round.extend(self.scheduler.descendants(&step.id).iter().cloned());
                    self.reset_steps(exec, &round);
                    self.retried.insert(step.id.clone());
                } else {
                    self.abort.get_or_insert(info);
                }
            }
            ErrorStrategy::Compensate => {
                tracing::warn!(execution_id = %exec.id, step_id = %step.id, "step failed, running compensation");
                for token in self.step_tokens.values() {
                    token.cancel();
                }
                self.failure.get_or_insert(info);
                self.compensation = Some(
                    self.definition
                        .error_handling
                        .compensation_steps
                        .iter()
                        .cloned()
                        .collect(),
                );
            }
        }
    }

    /// Mark a step failed and emit `step-failed`, without applying any
    /// error strategy.
    fn record_failure(&mut self, exec: &mut WorkflowExecution, step_id: &str, error: &WorkflowError) -> ErrorInfo {
        let info = error.to_info().for_step(step_id);
        let now = Utc::now();
        let mut attempts = 1;
        if let Some(record) = record_mut(&self.records, exec, step_id) {
            record.status = StepStatus::Failed;
            record.error = Some(info.clone());
            record.completed_at = Some(now);
            record.duration_ms = record
                .started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64);
            attempts = record.attempts;
        }

        exec.metrics.steps_failed += 1;
        self.inner.monitor.step_failed();
        self.state.statuses.insert(step_id.to_string(), StepStatus::Failed);
        self.release(exec, step_id);

        let event = new_event(exec, WorkflowEventType::StepFailed)
            .with_step(step_id)
            .with_message(error.to_string())
            .caused_by(self.started_events.get(step_id).copied())
            .with_data(json!({ "code": info.code, "attempts": attempts }));
        self.inner.emitter.emit(exec, event);
        let entry = step_entry(exec, step_id, StepStatus::Failed).failed();
        audit(&self.definition, exec, entry);
        info
    }

    /// Fail a step that was cut off rather than failing on its own.
    fn interrupt(&mut self, exec: &mut WorkflowExecution, step_id: &str, reason: &str) {
        self.loops.remove(step_id);
        let error = WorkflowError::Cancellation(reason.to_string());
        self.record_failure(exec, step_id, &error);
        tracing::warn!(execution_id = %exec.id, step_id, reason, "step interrupted");
    }

    /// Drop per-step run state once a step is terminal.
    fn release(&mut self, exec: &mut WorkflowExecution, step_id: &str) {
        self.step_tokens.remove(step_id);
        self.actions.remove(step_id);
        if exec.current_step.as_deref() == Some(step_id) {
            exec.current_step = None;
        }
    }

    /// Emit `failed` for a transition out of `from` (running or paused).
    fn emit_failed(&self, exec: &mut WorkflowExecution, info: ErrorInfo, from: ExecutionStatus) {
        let event = new_event(exec, WorkflowEventType::Failed)
            .with_message(info.message.clone())
            .with_data(json!({ "code": info.code, "step_id": info.step_id, "from": from }));
        self.inner.emitter.emit(exec, event);
        let entry = transition_entry(exec, "execution.fail", from, ExecutionStatus::Failed).failed();
        audit(&self.definition, exec, entry);
        exec.error = Some(info);
    }

    // -----------------------------------------------------------------------
    // Attempt outcomes
    // -----------------------------------------------------------------------

    async fn on_outcome(&mut self, outcome: AttemptOutcome) {
        let slot = Arc::clone(&self.slot);
        let mut exec = slot.execution.lock().await;

        if self.abandoned.remove(&outcome.step_id) {
            return;
        }
        if exec.status == ExecutionStatus::Cancelled {
            self.record_quietly(&mut exec, outcome);
            return;
        }

        let definition = Arc::clone(&self.definition);
        let Some(step) = definition.step(&outcome.step_id) else {
            return;
        };

        match outcome.result {
            Ok(output) => self.complete_step(&mut exec, &step.id, output, Some(outcome.elapsed_ms)),
            Err(failure) => {
                let may_retry = failure.retryable
                    && (self.compensation.is_none() || self.scheduler.is_compensation(&step.id));
                if may_retry {
                    let policy = RetryEvaluator::effective_policy(step, &definition, &self.inner.config);
                    if let RetryDecision::RetryAfter(delay) = RetryEvaluator::evaluate(&policy, outcome.attempt) {
                        self.retry_step(&mut exec, step, outcome.attempt + 1, delay, &failure.error);
                        return;
                    }
                }

                let error = if outcome.attempt > 1 {
                    WorkflowError::RetryExhausted {
                        step_id: step.id.clone(),
                        attempts: outcome.attempt,
                        message: failure.error.to_string(),
                    }
                } else {
                    failure.error
                };
                self.fail_step(&mut exec, step, error);
            }
        }
    }

    fn retry_step(
        &mut self,
        exec: &mut WorkflowExecution,
        step: &WorkflowStep,
        attempt: u32,
        delay: Duration,
        error: &WorkflowError,
    ) {
        if let Some(record) = record_mut(&self.records, exec, &step.id) {
            record.attempts = attempt;
        }
        exec.metrics.retries += 1;
        self.inner.monitor.retry();

        let delay_ms = delay.as_millis() as u64;
        let event = new_event(exec, WorkflowEventType::StepRetrying)
            .with_step(&step.id)
            .with_message(error.to_string())
            .caused_by(self.started_events.get(&step.id).copied())
            .with_data(json!({ "attempt": attempt, "delay_ms": delay_ms, "code": error.code() }));
        self.inner.emitter.emit(exec, event);
        tracing::warn!(
            execution_id = %exec.id,
            step_id = %step.id,
            attempt,
            delay_ms,
            error = %error,
            "retrying step"
        );

        self.spawn_attempt(step, attempt, delay);
    }

    /// Store a late outcome on its record without events or policy.
    fn record_quietly(&mut self, exec: &mut WorkflowExecution, outcome: AttemptOutcome) {
        if self.abandoned.remove(&outcome.step_id) {
            return;
        }
        let Some(record) = record_mut(&self.records, exec, &outcome.step_id) else {
            return;
        };
        if record.status != StepStatus::Running {
            return;
        }
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(outcome.elapsed_ms);
        match outcome.result {
            Ok(output) => {
                record.status = StepStatus::Completed;
                record.output = Some(cap_output(&outcome.step_id, output));
            }
            Err(failure) => {
                record.status = StepStatus::Failed;
                record.error = Some(failure.error.to_info().for_step(&outcome.step_id));
            }
        }
        let status = record.status;
        self.state.statuses.insert(outcome.step_id, status);
    }
}

fn record_mut<'a>(
    records: &HashMap<String, usize>,
    exec: &'a mut WorkflowExecution,
    step_id: &str,
) -> Option<&'a mut StepExecution> {
    records.get(step_id).and_then(|&i| exec.steps.get_mut(i))
}

/// Fail every record still marked running.
fn fail_running_records(exec: &mut WorkflowExecution, reason: &str) {
    let now = Utc::now();
    for record in exec.steps.iter_mut().filter(|r| r.status == StepStatus::Running) {
        record.status = StepStatus::Failed;
        record.completed_at = Some(now);
        record.error = Some(
            WorkflowError::Cancellation(reason.to_string())
                .to_info()
                .for_step(&record.step_id),
        );
    }
    exec.current_step = None;
}

/// Stamp completion time and total duration.
pub(super) fn close_execution(exec: &mut WorkflowExecution) {
    let now = Utc::now();
    exec.current_step = None;
    exec.completed_at = Some(now);
    exec.metrics.duration_ms = exec
        .started_at
        .map(|s| (now - s).num_milliseconds().max(0) as u64);
}

fn step_entry(exec: &WorkflowExecution, step_id: &str, status: StepStatus) -> AuditEntry {
    AuditEntry::new(
        exec.id,
        actor(exec),
        format!("step.{}", status.as_str()),
        format!("step:{step_id}"),
    )
    .with_change(Some(json!(StepStatus::Running)), Some(json!(status)))
}
