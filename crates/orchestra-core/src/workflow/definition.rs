//! Workflow definition parsing and validation.
//!
//! Converts between YAML and the canonical `WorkflowDefinition`, and checks
//! the structural constraints the engine relies on (unique ids, resolvable
//! references, single container ownership, acyclic dependencies). Field
//! problems are collected in one pass so callers see every error at once.

use std::collections::{HashMap, HashSet};

use orchestra_types::error::{FieldError, WorkflowError};
use orchestra_types::workflow::{StepConfig, StepType, TriggerConfig, WorkflowDefinition};

use super::dag::{owners, validate_dag};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Field checks run first and are reported together as
/// [`WorkflowError::Validation`]. Only a definition with clean fields is
/// checked for cycles, which yields [`WorkflowError::DependencyCycle`].
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let mut errors = Vec::new();

    check_header(def, &mut errors);
    check_steps(def, &mut errors);
    check_error_handling(def, &mut errors);
    check_triggers(def, &mut errors);

    if !errors.is_empty() {
        return Err(WorkflowError::Validation { errors });
    }

    validate_dag(&def.steps)
}

fn check_header(def: &WorkflowDefinition, errors: &mut Vec<FieldError>) {
    if def.name.is_empty() {
        errors.push(FieldError::new("name", "must not be empty"));
    } else if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        errors.push(FieldError::new(
            "name",
            format!(
                "'{}' contains invalid characters (alphanumeric, hyphen and underscore only)",
                def.name
            ),
        ));
    }

    if let Err(e) = semver::Version::parse(&def.version) {
        errors.push(FieldError::new(
            "version",
            format!("'{}' is not a semantic version: {e}", def.version),
        ));
    }

    if def.concurrency == Some(0) {
        errors.push(FieldError::new("concurrency", "must be >= 1"));
    }
    if def.timeout_ms == Some(0) {
        errors.push(FieldError::new("timeout_ms", "must be > 0"));
    }
}

fn check_steps(def: &WorkflowDefinition, errors: &mut Vec<FieldError>) {
    if def.steps.is_empty() {
        errors.push(FieldError::new("steps", "at least one step is required"));
        return;
    }

    let mut ids = HashSet::new();
    for (i, step) in def.steps.iter().enumerate() {
        if step.id.is_empty() {
            errors.push(FieldError::new(format!("steps[{i}].id"), "must not be empty"));
        } else if !ids.insert(step.id.as_str()) {
            errors.push(FieldError::new(
                format!("steps[{i}].id"),
                format!("duplicate step id '{}'", step.id),
            ));
        }
    }

    let by_id: HashMap<&str, StepType> = def
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.step_type()))
        .collect();
    let mut position: HashMap<&str, usize> = HashMap::new();
    for (i, step) in def.steps.iter().enumerate() {
        position.entry(step.id.as_str()).or_insert(i);
    }

    // Each step may be owned by at most one container slot.
    let mut owned_by: HashMap<&str, &str> = HashMap::new();

    for (i, step) in def.steps.iter().enumerate() {
        let at = |field: &str| format!("steps[{i}].{field}");

        for dep in &step.depends_on {
            match position.get(dep.as_str()) {
                None => errors.push(FieldError::new(
                    at("depends_on"),
                    format!("step '{}' depends on unknown step '{dep}'", step.id),
                )),
                Some(&j) if j >= i => errors.push(FieldError::new(
                    at("depends_on"),
                    format!(
                        "step '{}' depends on '{dep}', which must be declared earlier",
                        step.id
                    ),
                )),
                Some(_) => {}
            }
        }

        if step.timeout_ms == Some(0) {
            errors.push(FieldError::new(at("timeout_ms"), "must be > 0"));
        }
        if let Some(policy) = &step.retry_policy {
            if policy.max_delay_ms.is_some_and(|max| max < policy.initial_delay_ms) {
                errors.push(FieldError::new(
                    at("retry_policy.max_delay_ms"),
                    "must be >= initial_delay_ms",
                ));
            }
        }
        if step.when.as_deref().is_some_and(|w| w.trim().is_empty()) {
            errors.push(FieldError::new(at("when"), "must not be blank"));
        }

        match &step.config {
            StepConfig::Agent { agent, .. } if agent.is_empty() => {
                errors.push(FieldError::new(at("config.agent"), "must not be empty"));
            }
            StepConfig::Custom { handler, .. } if handler.is_empty() => {
                errors.push(FieldError::new(at("config.handler"), "must not be empty"));
            }
            StepConfig::Condition { expression, .. } if expression.trim().is_empty() => {
                errors.push(FieldError::new(at("config.expression"), "must not be empty"));
            }
            StepConfig::Loop {
                collection,
                item_variable,
                steps,
                ..
            } => {
                if collection.is_empty() {
                    errors.push(FieldError::new(at("config.collection"), "must not be empty"));
                }
                if item_variable.is_empty() {
                    errors.push(FieldError::new(at("config.item_variable"), "must not be empty"));
                }
                if steps.is_empty() {
                    errors.push(FieldError::new(at("config.steps"), "loop body must not be empty"));
                }
            }
            StepConfig::Parallel {
                steps,
                max_concurrency,
                ..
            } => {
                if steps.is_empty() {
                    errors.push(FieldError::new(at("config.steps"), "parallel group must not be empty"));
                }
                if *max_concurrency == Some(0) {
                    errors.push(FieldError::new(at("config.max_concurrency"), "must be >= 1"));
                }
            }
            _ => {}
        }

        for member in step.config.members() {
            if member == step.id {
                errors.push(FieldError::new(
                    at("config"),
                    format!("{} step '{}' cannot contain itself", step.step_type(), step.id),
                ));
            } else if !by_id.contains_key(member) {
                errors.push(FieldError::new(
                    at("config"),
                    format!(
                        "{} step '{}' references unknown step '{member}'",
                        step.step_type(),
                        step.id
                    ),
                ));
            } else if let Some(previous) = owned_by.insert(member, step.id.as_str()) {
                errors.push(FieldError::new(
                    at("config"),
                    format!("step '{member}' is already owned by '{previous}'"),
                ));
            }
        }
    }

    check_loop_isolation(def, errors);
}

/// Steps outside a loop may not depend on its body: body statuses reset on
/// every iteration, so only the loop step itself has a stable outcome.
fn check_loop_isolation(def: &WorkflowDefinition, errors: &mut Vec<FieldError>) {
    let owner_of = owners(&def.steps);
    let enclosing_loops = |id: &str| -> Vec<String> {
        let mut loops = Vec::new();
        let mut current = owner_of.get(id);
        let mut hops = 0;
        while let Some(owner) = current {
            if def
                .step(owner)
                .is_some_and(|s| s.step_type() == StepType::Loop)
            {
                loops.push(owner.clone());
            }
            current = owner_of.get(owner);
            hops += 1;
            if hops > def.steps.len() {
                break;
            }
        }
        loops
    };

    for (i, step) in def.steps.iter().enumerate() {
        let own_loops = enclosing_loops(&step.id);
        for dep in &step.depends_on {
            for loop_id in enclosing_loops(dep) {
                if !own_loops.contains(&loop_id) {
                    errors.push(FieldError::new(
                        format!("steps[{i}].depends_on"),
                        format!(
                            "step '{}' depends on '{dep}' inside loop '{loop_id}'; depend on '{loop_id}' instead",
                            step.id
                        ),
                    ));
                }
            }
        }
    }
}

fn check_error_handling(def: &WorkflowDefinition, errors: &mut Vec<FieldError>) {
    let owner_of = owners(&def.steps);
    let compensation: HashSet<&str> = def
        .error_handling
        .compensation_steps
        .iter()
        .map(String::as_str)
        .collect();

    for (i, id) in def.error_handling.compensation_steps.iter().enumerate() {
        let field = format!("error_handling.compensation_steps[{i}]");
        let Some(step) = def.step(id) else {
            errors.push(FieldError::new(field, format!("unknown step '{id}'")));
            continue;
        };
        if step.step_type().is_container() {
            errors.push(FieldError::new(
                field.clone(),
                format!("compensation step '{id}' must be an agent, custom or delay step"),
            ));
        }
        if owner_of.contains_key(id) {
            errors.push(FieldError::new(
                field.clone(),
                format!("compensation step '{id}' cannot belong to a container"),
            ));
        }
        if !step.depends_on.is_empty() {
            errors.push(FieldError::new(
                field,
                format!("compensation step '{id}' cannot declare dependencies"),
            ));
        }
    }

    for (i, step) in def.steps.iter().enumerate() {
        for dep in &step.depends_on {
            if compensation.contains(dep.as_str()) {
                errors.push(FieldError::new(
                    format!("steps[{i}].depends_on"),
                    format!("step '{}' cannot depend on compensation step '{dep}'", step.id),
                ));
            }
        }
    }
}

fn check_triggers(def: &WorkflowDefinition, errors: &mut Vec<FieldError>) {
    for (i, trigger) in def.triggers.iter().enumerate() {
        let field = format!("triggers[{i}]");
        match trigger {
            TriggerConfig::Schedule { cron } if cron.trim().is_empty() => {
                errors.push(FieldError::new(field, "cron expression must not be empty"));
            }
            TriggerConfig::Event { event } if event.is_empty() => {
                errors.push(FieldError::new(field, "event name must not be empty"));
            }
            TriggerConfig::Webhook { path } if !path.starts_with('/') => {
                errors.push(FieldError::new(field, format!("webhook path '{path}' must start with '/'")));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::workflow::{
        ErrorHandling, ErrorStrategy, ExecutionStrategy, RetryPolicy, WorkflowStep,
    };

    fn minimal_workflow(name: &str, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: uuid::Uuid::nil(),
            name: name.to_string(),
            description: None,
            version: "1.0.0".to_string(),
            strategy: ExecutionStrategy::Sequential,
            steps,
            triggers: vec![TriggerConfig::Manual],
            error_handling: ErrorHandling::default(),
            max_retries: 0,
            timeout_ms: None,
            concurrency: None,
            compliance: Default::default(),
            metadata: HashMap::new(),
        }
    }

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

    fn loop_step(id: &str, body: &[&str]) -> WorkflowStep {
        WorkflowStep {
            config: StepConfig::Loop {
                collection: "input.items".to_string(),
                item_variable: "item".to_string(),
                steps: body.iter().map(|b| b.to_string()).collect(),
                max_iterations: 5,
            },
            ..agent_step(id, &[])
        }
    }

    fn field_errors(result: Result<(), WorkflowError>) -> Vec<FieldError> {
        match result {
            Err(WorkflowError::Validation { errors }) => errors,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn valid_definition_passes() {
        let def = minimal_workflow("ok", vec![agent_step("a", &[]), agent_step("b", &["a"])]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn collects_every_field_error() {
        let mut def = minimal_workflow("bad name!", vec![agent_step("a", &["ghost"]), agent_step("a", &[])]);
        def.version = "one".to_string();
        let errors = field_errors(validate_definition(&def));
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"version"));
        assert!(fields.contains(&"steps[1].id"));
        assert!(fields.contains(&"steps[0].depends_on"));
    }

    #[test]
    fn rejects_empty_workflow() {
        let def = minimal_workflow("empty", vec![]);
        let errors = field_errors(validate_definition(&def));
        assert_eq!(errors[0].field, "steps");
    }

    #[test]
    fn rejects_zero_timeouts_and_concurrency() {
        let mut step = agent_step("a", &[]);
        step.timeout_ms = Some(0);
        let mut def = minimal_workflow("zeros", vec![step]);
        def.timeout_ms = Some(0);
        def.concurrency = Some(0);
        let errors = field_errors(validate_definition(&def));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn rejects_orphan_container_reference() {
        let def = minimal_workflow("orphan", vec![loop_step("each", &["missing"])]);
        let errors = field_errors(validate_definition(&def));
        assert!(errors[0].message.contains("unknown step 'missing'"));
    }

    #[test]
    fn rejects_double_ownership() {
        let def = minimal_workflow(
            "double",
            vec![loop_step("l1", &["x"]), loop_step("l2", &["x"]), agent_step("x", &[])],
        );
        let errors = field_errors(validate_definition(&def));
        assert!(errors.iter().any(|e| e.message.contains("already owned by 'l1'")));
    }

    #[test]
    fn rejects_dependency_on_loop_body_from_outside() {
        let def = minimal_workflow(
            "leaky",
            vec![loop_step("each", &["body"]), agent_step("body", &[]), agent_step("after", &["body"])],
        );
        let errors = field_errors(validate_definition(&def));
        assert!(errors[0].message.contains("inside loop 'each'"));
    }

    #[test]
    fn body_steps_may_depend_on_each_other() {
        let def = minimal_workflow(
            "body-chain",
            vec![
                loop_step("each", &["first", "second"]),
                agent_step("first", &[]),
                agent_step("second", &["first"]),
                agent_step("after", &["each"]),
            ],
        );
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn rejects_invalid_compensation_steps() {
        let mut def = minimal_workflow(
            "compensate",
            vec![agent_step("a", &[]), agent_step("undo", &["a"]), agent_step("b", &["undo"])],
        );
        def.error_handling = ErrorHandling {
            strategy: ErrorStrategy::Compensate,
            compensation_steps: vec!["undo".to_string(), "nope".to_string()],
        };
        let errors = field_errors(validate_definition(&def));
        assert!(errors.iter().any(|e| e.message.contains("cannot declare dependencies")));
        assert!(errors.iter().any(|e| e.message.contains("unknown step 'nope'")));
        assert!(errors.iter().any(|e| e.message.contains("cannot depend on compensation step")));
    }

    #[test]
    fn rejects_bad_retry_cap_and_trigger() {
        let mut step = agent_step("a", &[]);
        step.retry_policy = Some(RetryPolicy {
            max_retries: 2,
            backoff: Default::default(),
            initial_delay_ms: 500,
            max_delay_ms: Some(100),
        });
        let mut def = minimal_workflow("caps", vec![step]);
        def.triggers = vec![TriggerConfig::Webhook {
            path: "hooks".to_string(),
        }];
        let errors = field_errors(validate_definition(&def));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn rejects_forward_and_self_references() {
        let def = minimal_workflow(
            "forward",
            vec![agent_step("a", &["b"]), agent_step("b", &[]), agent_step("c", &["c"])],
        );
        let errors = field_errors(validate_definition(&def));
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "steps[0].depends_on");
        assert!(errors[0].message.contains("declared earlier"));
        assert_eq!(errors[1].field, "steps[2].depends_on");
    }

    #[test]
    fn cycle_reported_after_clean_fields() {
        // Every dependency points backwards, but the group cannot finish
        // before its member, which waits on the group's successor.
        let group = WorkflowStep {
            config: StepConfig::Parallel {
                steps: vec!["m".to_string()],
                max_concurrency: None,
                wait_for_all: true,
            },
            ..agent_step("group", &[])
        };
        let def = minimal_workflow(
            "cyclic",
            vec![group, agent_step("after", &["group"]), agent_step("m", &["after"])],
        );
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn parse_yaml_roundtrip() {
        let yaml = r#"
name: roundtrip
strategy: parallel
steps:
  - id: fetch
    config:
      type: agent
      agent: fetcher
  - id: wait
    depends_on: [fetch]
    config:
      type: delay
      duration_ms: 10
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.strategy, ExecutionStrategy::Parallel);
        let back = serialize_workflow_yaml(&def).unwrap();
        let reparsed = parse_workflow_yaml(&back).unwrap();
        assert_eq!(def, reparsed);
    }

    #[test]
    fn parse_yaml_rejects_malformed() {
        assert!(matches!(
            parse_workflow_yaml("name: [unterminated"),
            Err(WorkflowError::Parse(_))
        ));
    }
}
