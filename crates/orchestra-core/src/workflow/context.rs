//! Views over an execution's orchestration context.
//!
//! Builds the JSON object that conditions, guards, loop collections and
//! input templates are evaluated against:
//!
//! ```json
//! {
//!   "input": { ... },
//!   "variables": { ... },
//!   "steps": { "<id>": { "output": ..., "status": "completed" } },
//!   "stepHistory": ["<id>", ...],
//!   "execution": { "id": "...", "workflowId": "...", "correlationId": ... }
//! }
//! ```
//!
//! Variables are also exposed at the top level (reserved keys win), so a loop
//! body can write `{{ item.sku }}` instead of `{{ variables.item.sku }}`.

use orchestra_types::execution::WorkflowExecution;
use serde_json::{Map, Value, json};

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Build the evaluation context for an execution.
pub fn expression_context(execution: &WorkflowExecution) -> Value {
    let ctx = &execution.context;

    let mut steps = Map::new();
    for record in &execution.steps {
        let output = ctx
            .step_outputs
            .get(&record.step_id)
            .cloned()
            .unwrap_or(Value::Null);
        steps.insert(
            record.step_id.clone(),
            json!({ "output": output, "status": record.status.as_str() }),
        );
    }

    let variables: Map<String, Value> = ctx
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut root = variables.clone();
    root.insert("input".to_string(), execution.input.clone());
    root.insert("variables".to_string(), Value::Object(variables));
    root.insert("steps".to_string(), Value::Object(steps));
    root.insert("stepHistory".to_string(), json!(ctx.step_history));
    root.insert(
        "execution".to_string(),
        json!({
            "id": execution.id,
            "workflowId": execution.workflow_id,
            "correlationId": execution.correlation_id,
        }),
    );
    Value::Object(root)
}

/// Resolve a dotted path (`steps.fetch.output.items.0`) inside a context.
pub fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(context, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Resolve `{{ path }}` templates inside a string.
///
/// A string that is exactly one template is replaced by the raw value, so
/// objects and numbers keep their type. Otherwise each template is rendered
/// as text. Unresolvable templates are left as-is.
pub fn resolve_template(template: &str, context: &Value) -> Value {
    let trimmed = template.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") {
            return match lookup_path(context, inner.trim()) {
                Some(value) => value.clone(),
                None => Value::String(template.to_string()),
            };
        }
    }

    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let end = start + len + 2;
        result.push_str(&rest[..start]);
        let path = rest[start + 2..end - 2].trim();
        match lookup_path(context, path) {
            Some(value) => result.push_str(&value_to_string(value)),
            None => result.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }
    result.push_str(rest);
    Value::String(result)
}

/// Resolve templates in every string leaf of a step's input mapping.
pub fn resolve_input(input: &Value, context: &Value) -> Value {
    match input {
        Value::String(s) if s.contains("{{") => resolve_template(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_input(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_input(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replace an oversized step output with a truncation marker.
pub fn cap_output(step_id: &str, output: Value) -> Value {
    let size = serde_json::to_vec(&output).map(|v| v.len()).unwrap_or(0);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return output;
    }
    tracing::warn!(
        step_id,
        size,
        max = MAX_STEP_OUTPUT_SIZE,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
    })
}

/// Render a JSON value for string interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
