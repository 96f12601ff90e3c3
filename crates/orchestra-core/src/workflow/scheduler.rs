//! Step scheduler: decides which steps to dispatch, skip, or close next.
//!
//! Pure function of (definition, step states). The coordinator applies the
//! returned decisions, updates [`SchedulerState`], and asks again until no
//! decisions come back.
//!
//! Release rules:
//! - **Container ownership** gates members first. Branch members wait for
//!   their condition and are skipped when their branch is not taken; parallel
//!   members run while their group is running; loop members run while an
//!   iteration is active. A member whose container ended without running it
//!   is skipped.
//! - **Dependencies** are satisfied by completed, skipped, or tolerated-failed
//!   steps. Under conditional and hybrid strategies a step whose
//!   dependencies were all skipped is skipped too.
//! - **Strategy slots**: sequential and conditional release one step at a
//!   time in declaration order (a running step only lets its own descendants
//!   through); parallel and hybrid release every ready step, bounded by
//!   `max_concurrent_steps` leaf steps. Parallel group members bypass the
//!   strategy slot and are bounded by the group's `max_concurrency` instead.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use orchestra_types::execution::StepStatus;
use orchestra_types::workflow::{StepConfig, WorkflowDefinition, WorkflowStep};

use super::dag;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Mutable scheduling view owned by the coordinator.
///
/// A step absent from `statuses` is pending and has no record in the
/// current loop iteration. Members of a skipped container are marked
/// skipped here without a record of their own.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub statuses: HashMap<String, StepStatus>,
    /// Failed steps whose failure lets dependents proceed.
    pub tolerated: HashSet<String>,
    /// Result of each completed condition step.
    pub branches: HashMap<String, bool>,
}

impl SchedulerState {
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.statuses.get(step_id).copied()
    }

    fn is_terminal(&self, step_id: &str) -> bool {
        self.status(step_id).is_some_and(StepStatus::is_terminal)
    }
}

/// Why a step was skipped without running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The owning condition took the other branch.
    BranchNotTaken { condition: String },
    /// The owning container failed or was skipped.
    ContainerNotRun { container: String },
    /// The owning group or loop finished before the step started.
    ContainerFinished { container: String },
    /// Every dependency was skipped.
    DependenciesSkipped,
    /// The step's `when` guard evaluated to false.
    GuardFalse,
    /// A compensation step that was not needed.
    CompensationNotNeeded,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BranchNotTaken { condition } => {
                write!(f, "branch not taken by condition '{condition}'")
            }
            Self::ContainerNotRun { container } => write!(f, "container '{container}' did not run"),
            Self::ContainerFinished { container } => {
                write!(f, "container '{container}' finished before the step started")
            }
            Self::DependenciesSkipped => f.write_str("all dependencies were skipped"),
            Self::GuardFalse => f.write_str("when guard evaluated to false"),
            Self::CompensationNotNeeded => f.write_str("compensation was not needed"),
        }
    }
}

/// One scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Start the step now.
    Dispatch(String),
    /// Record the step as skipped.
    Skip { step_id: String, reason: SkipReason },
    /// A running parallel group has met its completion rule.
    CompleteGroup(String),
    /// Every step of the running loop iteration is terminal.
    FinishIteration(String),
}

enum Gate {
    Ready,
    Wait,
    Skip(SkipReason),
}

// ---------------------------------------------------------------------------
// StepScheduler
// ---------------------------------------------------------------------------

/// Precomputed structure of one definition.
#[derive(Debug)]
pub struct StepScheduler {
    definition: Arc<WorkflowDefinition>,
    owners: HashMap<String, String>,
    ancestors: HashMap<String, HashSet<String>>,
    descendants: HashMap<String, Vec<String>>,
    compensation: HashSet<String>,
    max_concurrent_steps: usize,
}

impl StepScheduler {
    /// `definition` must already be validated (acyclic, single ownership).
    pub fn new(definition: Arc<WorkflowDefinition>, max_concurrent_steps: usize) -> Self {
        let owners = dag::owners(&definition.steps);
        let ancestors = dag::ancestors(&definition.steps);
        let descendants = dag::descendants(&definition.steps);
        let compensation = definition
            .error_handling
            .compensation_steps
            .iter()
            .cloned()
            .collect();
        Self {
            definition,
            owners,
            ancestors,
            descendants,
            compensation,
            max_concurrent_steps: max_concurrent_steps.max(1),
        }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// The container owning `step_id`, if any.
    pub fn owner(&self, step_id: &str) -> Option<&str> {
        self.owners.get(step_id).map(String::as_str)
    }

    /// Steps transitively owned by a container, in declaration order.
    pub fn descendants(&self, container_id: &str) -> &[String] {
        self.descendants
            .get(container_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Innermost loop enclosing a step.
    pub fn enclosing_loop(&self, step_id: &str) -> Option<&str> {
        let mut current = self.owner(step_id);
        while let Some(owner) = current {
            if matches!(
                self.definition.step(owner).map(|s| &s.config),
                Some(StepConfig::Loop { .. })
            ) {
                return Some(owner);
            }
            current = self.owner(owner);
        }
        None
    }

    pub fn is_compensation(&self, step_id: &str) -> bool {
        self.compensation.contains(step_id)
    }

    /// Compute the next batch of decisions.
    ///
    /// Returns an empty vec once nothing can move until a running step
    /// reports back (or the execution is finished).
    pub fn next(&self, state: &SchedulerState) -> Vec<ScheduleDecision> {
        let mut decisions = self.container_transitions(state);
        let strategy = self.definition.strategy;

        // Members of a group closing in this batch are left for the next one.
        let closing: HashSet<String> = decisions
            .iter()
            .filter_map(|d| match d {
                ScheduleDecision::CompleteGroup(id) => Some(id.clone()),
                _ => None,
            })
            .collect();

        // Steps holding a strategy slot: running, and not parallel-group members.
        let mut slot_holders: Vec<&str> = Vec::new();
        let mut running_leaves = 0usize;
        let mut group_running: HashMap<&str, usize> = HashMap::new();

        for step in &self.definition.steps {
            if state.status(&step.id) != Some(StepStatus::Running) {
                continue;
            }
            match self.parallel_owner(&step.id) {
                Some(group) => *group_running.entry(group).or_default() += 1,
                None => {
                    slot_holders.push(&step.id);
                    if !step.step_type().is_container() {
                        running_leaves += 1;
                    }
                }
            }
        }

        for step in &self.definition.steps {
            if state.statuses.contains_key(&step.id) || self.is_compensation(&step.id) {
                continue;
            }
            if self.owner(&step.id).is_some_and(|o| closing.contains(o)) {
                continue;
            }

            match self.gate(step, state) {
                Gate::Wait => continue,
                Gate::Skip(reason) => {
                    decisions.push(ScheduleDecision::Skip {
                        step_id: step.id.clone(),
                        reason,
                    });
                    continue;
                }
                Gate::Ready => {}
            }

            if let Some(group) = self.parallel_owner(&step.id) {
                let limit = self.group_limit(group);
                let running = group_running.entry(group).or_default();
                if *running >= limit {
                    continue;
                }
                *running += 1;
                decisions.push(ScheduleDecision::Dispatch(step.id.clone()));
                continue;
            }

            if strategy.is_serial() {
                let ancestors = self.ancestors.get(&step.id);
                if slot_holders
                    .iter()
                    .any(|h| !ancestors.is_some_and(|a| a.contains(*h)))
                {
                    continue;
                }
                slot_holders.push(&step.id);
            } else if !step.step_type().is_container() {
                if running_leaves >= self.max_concurrent_steps {
                    continue;
                }
                running_leaves += 1;
            }

            decisions.push(ScheduleDecision::Dispatch(step.id.clone()));
        }

        decisions
    }

    /// Every step that could still change state if the execution continued.
    pub fn unfinished<'a>(&'a self, state: &'a SchedulerState) -> impl Iterator<Item = &'a WorkflowStep> + 'a {
        self.definition
            .steps
            .iter()
            .filter(move |s| !self.is_compensation(&s.id) && !state.is_terminal(&s.id))
    }

    fn container_transitions(&self, state: &SchedulerState) -> Vec<ScheduleDecision> {
        let mut decisions = Vec::new();
        for step in &self.definition.steps {
            if state.status(&step.id) != Some(StepStatus::Running) {
                continue;
            }
            let all_done = || {
                self.descendants(&step.id)
                    .iter()
                    .all(|d| state.is_terminal(d))
            };
            match &step.config {
                StepConfig::Parallel {
                    steps,
                    wait_for_all,
                    ..
                } => {
                    let first_done = !*wait_for_all
                        && steps
                            .iter()
                            .any(|m| state.status(m) == Some(StepStatus::Completed));
                    if first_done || all_done() {
                        decisions.push(ScheduleDecision::CompleteGroup(step.id.clone()));
                    }
                }
                StepConfig::Loop { .. } if all_done() => {
                    decisions.push(ScheduleDecision::FinishIteration(step.id.clone()));
                }
                _ => {}
            }
        }
        decisions
    }

    fn gate(&self, step: &WorkflowStep, state: &SchedulerState) -> Gate {
        if let Some(owner_id) = self.owner(&step.id) {
            let owner_status = state.status(owner_id);
            let Some(owner) = self.definition.step(owner_id) else {
                return Gate::Wait;
            };
            match (&owner.config, owner_status) {
                (StepConfig::Condition { true_branch, .. }, Some(StepStatus::Completed)) => {
                    let in_true = true_branch.iter().any(|m| m == &step.id);
                    if state.branches.get(owner_id).copied() != Some(in_true) {
                        return Gate::Skip(SkipReason::BranchNotTaken {
                            condition: owner_id.to_string(),
                        });
                    }
                }
                (StepConfig::Condition { .. }, Some(StepStatus::Failed | StepStatus::Skipped)) => {
                    return Gate::Skip(SkipReason::ContainerNotRun {
                        container: owner_id.to_string(),
                    });
                }
                (StepConfig::Parallel { .. } | StepConfig::Loop { .. }, Some(StepStatus::Running)) => {}
                (StepConfig::Parallel { .. } | StepConfig::Loop { .. }, Some(StepStatus::Completed)) => {
                    return Gate::Skip(SkipReason::ContainerFinished {
                        container: owner_id.to_string(),
                    });
                }
                (StepConfig::Parallel { .. } | StepConfig::Loop { .. }, Some(StepStatus::Failed | StepStatus::Skipped)) => {
                    return Gate::Skip(SkipReason::ContainerNotRun {
                        container: owner_id.to_string(),
                    });
                }
                _ => return Gate::Wait,
            }
        }

        let mut all_skipped = !step.depends_on.is_empty();
        for dep in &step.depends_on {
            match state.status(dep) {
                Some(StepStatus::Completed) => all_skipped = false,
                Some(StepStatus::Skipped) => {}
                Some(StepStatus::Failed) if state.tolerated.contains(dep) => all_skipped = false,
                _ => return Gate::Wait,
            }
        }

        if all_skipped && self.definition.strategy.cascades_skips() {
            return Gate::Skip(SkipReason::DependenciesSkipped);
        }
        Gate::Ready
    }

    fn parallel_owner(&self, step_id: &str) -> Option<&str> {
        let owner = self.owner(step_id)?;
        matches!(
            self.definition.step(owner).map(|s| &s.config),
            Some(StepConfig::Parallel { .. })
        )
        .then_some(owner)
    }

    fn group_limit(&self, group_id: &str) -> usize {
        match self.definition.step(group_id).map(|s| &s.config) {
            Some(StepConfig::Parallel {
                max_concurrency: Some(limit),
                ..
            }) => (*limit as usize).max(1),
            _ => self.max_concurrent_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::workflow::{ErrorHandling, ErrorStrategy, ExecutionStrategy};
    use std::collections::HashMap as Map;

    fn agent_step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            retry_policy: None,
            continue_on_error: false,
            timeout_ms: None,
            when: None,
            config: StepConfig::Agent {
                agent: "worker".to_string(),
                input: serde_json::Value::Null,
            },
        }
    }

    fn with_config(id: &str, deps: &[&str], config: StepConfig) -> WorkflowStep {
        WorkflowStep {
            config,
            ..agent_step(id, deps)
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn scheduler(strategy: ExecutionStrategy, steps: Vec<WorkflowStep>, max: usize) -> StepScheduler {
        let def = WorkflowDefinition {
            id: uuid::Uuid::now_v7(),
            name: "test".into(),
            description: None,
            version: "1.0.0".into(),
            strategy,
            steps,
            triggers: vec![],
            error_handling: ErrorHandling::default(),
            max_retries: 0,
            timeout_ms: None,
            concurrency: None,
            compliance: Default::default(),
            metadata: Map::new(),
        };
        StepScheduler::new(Arc::new(def), max)
    }

    fn dispatched(decisions: &[ScheduleDecision]) -> Vec<&str> {
        decisions
            .iter()
            .filter_map(|d| match d {
                ScheduleDecision::Dispatch(id) => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    fn skipped(decisions: &[ScheduleDecision]) -> Vec<&str> {
        decisions
            .iter()
            .filter_map(|d| match d {
                ScheduleDecision::Skip { step_id, .. } => Some(step_id.as_str()),
                _ => None,
            })
            .collect()
    }

    fn set(state: &mut SchedulerState, id: &str, status: StepStatus) {
        state.statuses.insert(id.to_string(), status);
    }

    #[test]
    fn sequential_releases_one_step_in_declaration_order() {
        let s = scheduler(
            ExecutionStrategy::Sequential,
            vec![agent_step("a", &[]), agent_step("b", &[]), agent_step("c", &[])],
            16,
        );
        let mut state = SchedulerState::default();
        assert_eq!(dispatched(&s.next(&state)), vec!["a"]);

        set(&mut state, "a", StepStatus::Running);
        assert!(s.next(&state).is_empty());

        set(&mut state, "a", StepStatus::Completed);
        assert_eq!(dispatched(&s.next(&state)), vec!["b"]);
    }

    #[test]
    fn parallel_releases_all_ready_steps_within_budget() {
        let s = scheduler(
            ExecutionStrategy::Parallel,
            vec![
                agent_step("a", &[]),
                agent_step("b", &[]),
                agent_step("c", &[]),
                agent_step("d", &["a"]),
            ],
            2,
        );
        let mut state = SchedulerState::default();
        assert_eq!(dispatched(&s.next(&state)), vec!["a", "b"]);

        set(&mut state, "a", StepStatus::Completed);
        set(&mut state, "b", StepStatus::Running);
        assert_eq!(dispatched(&s.next(&state)), vec!["c"]);
    }

    #[test]
    fn failed_dependency_blocks_unless_tolerated() {
        let s = scheduler(
            ExecutionStrategy::Parallel,
            vec![agent_step("a", &[]), agent_step("b", &["a"])],
            16,
        );
        let mut state = SchedulerState::default();
        set(&mut state, "a", StepStatus::Failed);
        assert!(s.next(&state).is_empty());

        state.tolerated.insert("a".into());
        assert_eq!(dispatched(&s.next(&state)), vec!["b"]);
    }

    #[test]
    fn skip_cascade_only_under_conditional_strategies() {
        let steps = vec![agent_step("a", &[]), agent_step("b", &["a"])];
        let mut state = SchedulerState::default();
        set(&mut state, "a", StepStatus::Skipped);

        let seq = scheduler(ExecutionStrategy::Sequential, steps.clone(), 16);
        assert_eq!(dispatched(&seq.next(&state)), vec!["b"]);

        let hybrid = scheduler(ExecutionStrategy::Hybrid, steps, 16);
        assert_eq!(skipped(&hybrid.next(&state)), vec!["b"]);
    }

    #[test]
    fn condition_releases_taken_branch_and_skips_other() {
        let s = scheduler(
            ExecutionStrategy::Parallel,
            vec![
                with_config(
                    "check",
                    &[],
                    StepConfig::Condition {
                        expression: "x".into(),
                        true_branch: ids(&["yes"]),
                        false_branch: ids(&["no1", "no2"]),
                    },
                ),
                agent_step("yes", &[]),
                agent_step("no1", &[]),
                agent_step("no2", &["no1"]),
            ],
            16,
        );
        let mut state = SchedulerState::default();
        assert_eq!(dispatched(&s.next(&state)), vec!["check"]);

        set(&mut state, "check", StepStatus::Completed);
        state.branches.insert("check".into(), false);
        let decisions = s.next(&state);
        assert_eq!(skipped(&decisions), vec!["yes"]);
        assert_eq!(dispatched(&decisions), vec!["no1"]);
    }

    #[test]
    fn failed_condition_skips_members() {
        let s = scheduler(
            ExecutionStrategy::Sequential,
            vec![
                with_config(
                    "check",
                    &[],
                    StepConfig::Condition {
                        expression: "x".into(),
                        true_branch: ids(&["yes"]),
                        false_branch: vec![],
                    },
                ),
                agent_step("yes", &[]),
            ],
            16,
        );
        let mut state = SchedulerState::default();
        set(&mut state, "check", StepStatus::Failed);
        state.tolerated.insert("check".into());
        let decisions = s.next(&state);
        assert_eq!(
            decisions,
            vec![ScheduleDecision::Skip {
                step_id: "yes".into(),
                reason: SkipReason::ContainerNotRun {
                    container: "check".into()
                }
            }]
        );
    }

    #[test]
    fn parallel_group_respects_max_concurrency_under_sequential() {
        let members = ["m1", "m2", "m3", "m4", "m5"];
        let mut steps = vec![with_config(
            "group",
            &[],
            StepConfig::Parallel {
                steps: ids(&members),
                max_concurrency: Some(2),
                wait_for_all: true,
            },
        )];
        steps.extend(members.iter().map(|m| agent_step(m, &[])));
        steps.push(agent_step("after", &["group"]));
        let s = scheduler(ExecutionStrategy::Sequential, steps, 16);

        let mut state = SchedulerState::default();
        assert_eq!(dispatched(&s.next(&state)), vec!["group"]);

        set(&mut state, "group", StepStatus::Running);
        assert_eq!(dispatched(&s.next(&state)), vec!["m1", "m2"]);

        set(&mut state, "m1", StepStatus::Running);
        set(&mut state, "m2", StepStatus::Running);
        assert!(s.next(&state).is_empty());

        set(&mut state, "m1", StepStatus::Completed);
        assert_eq!(dispatched(&s.next(&state)), vec!["m3"]);
    }

    #[test]
    fn wait_for_all_group_completes_only_when_members_terminal() {
        let s = scheduler(
            ExecutionStrategy::Parallel,
            vec![
                with_config(
                    "group",
                    &[],
                    StepConfig::Parallel {
                        steps: ids(&["m1", "m2"]),
                        max_concurrency: None,
                        wait_for_all: true,
                    },
                ),
                agent_step("m1", &[]),
                agent_step("m2", &[]),
            ],
            16,
        );
        let mut state = SchedulerState::default();
        set(&mut state, "group", StepStatus::Running);
        set(&mut state, "m1", StepStatus::Completed);
        set(&mut state, "m2", StepStatus::Running);
        assert!(!s.next(&state).contains(&ScheduleDecision::CompleteGroup("group".into())));

        set(&mut state, "m2", StepStatus::Completed);
        assert_eq!(s.next(&state), vec![ScheduleDecision::CompleteGroup("group".into())]);
    }

    #[test]
    fn first_completion_closes_group_without_wait_for_all() {
        let s = scheduler(
            ExecutionStrategy::Parallel,
            vec![
                with_config(
                    "race",
                    &[],
                    StepConfig::Parallel {
                        steps: ids(&["fast", "slow", "late"]),
                        max_concurrency: Some(2),
                        wait_for_all: false,
                    },
                ),
                agent_step("fast", &[]),
                agent_step("slow", &[]),
                agent_step("late", &[]),
            ],
            16,
        );
        let mut state = SchedulerState::default();
        set(&mut state, "race", StepStatus::Running);
        set(&mut state, "fast", StepStatus::Completed);
        set(&mut state, "slow", StepStatus::Running);
        assert_eq!(s.next(&state), vec![ScheduleDecision::CompleteGroup("race".into())]);

        set(&mut state, "race", StepStatus::Completed);
        assert_eq!(skipped(&s.next(&state)), vec!["late"]);
    }

    #[test]
    fn loop_iteration_finishes_when_body_terminal() {
        let s = scheduler(
            ExecutionStrategy::Sequential,
            vec![
                with_config(
                    "each",
                    &[],
                    StepConfig::Loop {
                        collection: "input.items".into(),
                        item_variable: "item".into(),
                        steps: ids(&["first", "second"]),
                        max_iterations: 5,
                    },
                ),
                agent_step("first", &[]),
                agent_step("second", &["first"]),
                agent_step("after", &["each"]),
            ],
            16,
        );
        let mut state = SchedulerState::default();
        set(&mut state, "each", StepStatus::Running);
        assert_eq!(dispatched(&s.next(&state)), vec!["first"]);

        set(&mut state, "first", StepStatus::Completed);
        assert_eq!(dispatched(&s.next(&state)), vec!["second"]);

        set(&mut state, "second", StepStatus::Completed);
        assert_eq!(s.next(&state), vec![ScheduleDecision::FinishIteration("each".into())]);
        assert_eq!(s.enclosing_loop("second"), Some("each"));
        assert_eq!(s.enclosing_loop("after"), None);
    }

    #[test]
    fn compensation_steps_never_scheduled_normally() {
        let mut s = scheduler(
            ExecutionStrategy::Parallel,
            vec![agent_step("a", &[]), agent_step("undo", &[])],
            16,
        );
        let mut def = (*s.definition).clone();
        def.error_handling = ErrorHandling {
            strategy: ErrorStrategy::Compensate,
            compensation_steps: ids(&["undo"]),
        };
        s = StepScheduler::new(Arc::new(def), 16);
        let state = SchedulerState::default();
        assert_eq!(dispatched(&s.next(&state)), vec!["a"]);

        let mut state = state;
        set(&mut state, "a", StepStatus::Completed);
        assert!(s.next(&state).is_empty());
        assert_eq!(s.unfinished(&state).count(), 0);
    }
}
