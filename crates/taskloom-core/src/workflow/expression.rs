//! JEXL evaluation of concurrency group-key expressions.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of string transforms. The
//! run's input and metadata are always passed as the context object, never
//! interpolated into the expression string.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::EngineError;

/// Evaluates `concurrency.expression` against a run's input.
///
/// The expression sees `input` and `additional_metadata`. It must produce a
/// string or a number; anything else is rejected.
pub struct GroupKeyEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl GroupKeyEvaluator {
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
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("string", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(match val {
                    Value::String(s) => json!(s),
                    other => json!(other.to_string()),
                })
            });

        Self { evaluator }
    }

    /// Evaluate `expression` to a group key.
    pub fn evaluate(
        &self,
        expression: &str,
        input: &Value,
        additional_metadata: &BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        let context = json!({
            "input": input,
            "additional_metadata": additional_metadata,
        });
        let result = self
            .evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| EngineError::Expression(e.to_string()))?;
        key_from_value(&result).ok_or_else(|| {
            EngineError::Expression(format!(
                "'{expression}' must evaluate to a string or number, got {result}"
            ))
        })
    }
}

impl Default for GroupKeyEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Integral numbers render without a fractional part so `7` and `7.0` share a key.
fn key_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => Some(format!("{}", f as i64)),
            _ => Some(n.to_string()),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str, input: Value) -> Result<String, EngineError> {
        GroupKeyEvaluator::new().evaluate(expression, &input, &BTreeMap::new())
    }

    #[test]
    fn test_string_key_from_input() {
        let key = eval("input.tenant", json!({"tenant": "acme"})).unwrap();
        assert_eq!(key, "acme");
    }

    #[test]
    fn test_numeric_key_is_integral() {
        let key = eval("input.shard", json!({"shard": 7})).unwrap();
        assert_eq!(key, "7");
    }

    #[test]
    fn test_transforms_apply() {
        let key = eval("input.tenant|lower", json!({"tenant": "ACME"})).unwrap();
        assert_eq!(key, "acme");
    }

    #[test]
    fn test_metadata_is_visible() {
        let mut metadata = BTreeMap::new();
        metadata.insert("region".to_string(), json!("eu"));
        let key = GroupKeyEvaluator::new()
            .evaluate("additional_metadata.region", &json!({}), &metadata)
            .unwrap();
        assert_eq!(key, "eu");
    }

    #[test]
    fn test_non_scalar_result_rejected() {
        let err = eval("input.tags", json!({"tags": ["a", "b"]})).unwrap_err();
        assert!(matches!(err, EngineError::Expression(_)));
    }

    #[test]
    fn test_missing_field_rejected() {
        assert!(eval("input.nothing", json!({})).is_err());
    }
}
