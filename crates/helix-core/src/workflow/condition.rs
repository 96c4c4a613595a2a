//! JEXL condition gates for workflows and tasks.
//!
//! Wraps `jexl_eval::Evaluator` with a few standard transforms. Values are
//! always passed as context objects, never interpolated into expressions.

use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid condition context: {0}")]
    InvalidContext(String),
}

/// Evaluates `condition` expressions such as
/// `input.region == 'eu'` or `tasks.fetch.count > 0`.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` against `context` (must be a JSON object),
    /// coercing the result with JavaScript-like truthiness.
    pub fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ConditionError> {
        if !context.is_object() {
            return Err(ConditionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ConditionError::EvalFailed(e.to_string()))?;

        Ok(truthy(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
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
            "input": {"region": "EU", "limit": 3},
            "tasks": {"fetch": {"rows": [1, 2]}}
        })
    }

    #[test]
    fn comparison_on_input() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate("input.limit > 2", &ctx()).unwrap());
        assert!(!eval.evaluate("input.limit > 5", &ctx()).unwrap());
    }

    #[test]
    fn transforms() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate("input.region|lower == 'eu'", &ctx()).unwrap());
        assert!(eval.evaluate("tasks.fetch.rows|length == 2", &ctx()).unwrap());
    }

    #[test]
    fn missing_path_is_falsy() {
        let eval = ConditionEvaluator::new();
        assert!(!eval.evaluate("tasks.nothing", &ctx()).unwrap());
    }

    #[test]
    fn non_object_context_is_rejected() {
        let eval = ConditionEvaluator::new();
        assert!(matches!(
            eval.evaluate("true", &json!(1)),
            Err(ConditionError::InvalidContext(_))
        ));
    }

    #[test]
    fn syntax_error_is_eval_failure() {
        let eval = ConditionEvaluator::new();
        assert!(matches!(
            eval.evaluate("input.limit >", &ctx()),
            Err(ConditionError::EvalFailed(_))
        ));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!("x")));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([])));
    }
}
