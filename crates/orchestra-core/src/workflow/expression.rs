//! Expression evaluation for condition steps and `when` guards.
//!
//! The engine only depends on the [`ExpressionEvaluator`] trait. The default
//! [`JexlEvaluator`] wraps `jexl_eval::Evaluator` with a handful of string
//! and collection transforms.
//!
//! Context values are always passed as a context object, never interpolated
//! into the expression string.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Boolean expression evaluation against an execution context.
///
/// Object-safe so the coordinator can hold `Arc<dyn ExpressionEvaluator>`.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError>;
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms registered.
///
/// Examples:
/// - `steps.fetch.output.count > 0`
/// - `input.region|lower == 'eu'`
/// - `variables.tags|length >= 2`
///
/// `jexl_eval::Evaluator` holds non-`Send` transform closures, so one is
/// built per evaluation; that keeps this type `Send + Sync`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlEvaluator;

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn evaluator() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        let needle = args.get(1).cloned().unwrap_or(Value::Null);
                        items.contains(&needle)
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        Self::evaluator()
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    /// Results are coerced with JavaScript-like truthiness.
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Value {
        json!({
            "input": { "region": "EU", "amount": 120, "note": "" },
            "steps": { "fetch": { "output": { "count": 3, "items": ["a", "b"] }, "status": "completed" } },
            "variables": { "tier": "gold" }
        })
    }

    #[test]
    fn comparisons_against_step_output() {
        let eval = JexlEvaluator::new();
        assert!(eval.evaluate("steps.fetch.output.count > 0", &ctx()).unwrap());
        assert!(!eval.evaluate("steps.fetch.output.count > 5", &ctx()).unwrap());
    }

    #[test]
    fn transforms_apply() {
        let eval = JexlEvaluator::new();
        assert!(eval.evaluate("input.region|lower == 'eu'", &ctx()).unwrap());
        assert!(eval.evaluate("steps.fetch.output.items|length == 2", &ctx()).unwrap());
        assert!(eval.evaluate("variables.tier|startsWith('go')", &ctx()).unwrap());
        assert!(eval.evaluate("steps.fetch.output.items|contains('b')", &ctx()).unwrap());
    }

    #[test]
    fn truthiness_coercion() {
        let eval = JexlEvaluator::new();
        assert!(eval.evaluate("input.amount", &ctx()).unwrap());
        assert!(!eval.evaluate("input.note", &ctx()).unwrap());
        assert!(eval.evaluate("input.note|not", &ctx()).unwrap());
    }

    #[test]
    fn non_object_context_is_rejected() {
        let eval = JexlEvaluator::new();
        assert!(matches!(
            eval.evaluate("true", &json!([1, 2])),
            Err(ExpressionError::InvalidContext(_))
        ));
    }

    #[test]
    fn syntax_error_is_reported() {
        let eval = JexlEvaluator::new();
        assert!(matches!(
            eval.evaluate("input.amount >", &ctx()),
            Err(ExpressionError::EvalFailed(_))
        ));
    }

    #[test]
    fn usable_as_trait_object() {
        let eval: std::sync::Arc<dyn ExpressionEvaluator> = std::sync::Arc::new(JexlEvaluator::new());
        assert!(eval.evaluate("variables.tier == 'gold'", &ctx()).unwrap());
    }
}
