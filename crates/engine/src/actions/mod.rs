//! Built-in actions and the helpers their handlers share.

pub mod command;
pub mod control;
pub mod data;
pub mod delay;
pub mod http;
pub mod output;
pub mod trigger;

use runbook_types::Step;
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::{EngineError, EngineResult},
    expression,
    registry::{ActionRegistry, ActionScope},
    resolve::{display_value, resolve_value},
};

/// Registers every built-in action.
pub fn register_builtin_actions(registry: &mut ActionRegistry) -> EngineResult<()> {
    registry.register(data::set_var_descriptor())?;
    registry.register(output::print_msg_descriptor())?;
    registry.register(command::descriptor())?;
    registry.register(output::eval_descriptor())?;
    registry.register(control::condition_descriptor())?;
    registry.register(control::loop_descriptor())?;
    registry.register(delay::descriptor())?;
    registry.register(trigger::descriptor())?;
    registry.register(http::descriptor())?;
    registry.register(data::combine_data_descriptor())?;
    Ok(())
}

/// Deserializes a resolved step into the action's typed field struct.
pub(crate) fn parse_fields<T: DeserializeOwned>(action: &str, step: &Step) -> EngineResult<T> {
    serde_json::from_value(Value::Object(step.fields().clone()))
        .map_err(|error| EngineError::invalid_field(action, "step", error.to_string()))
}

/// Evaluates `expression` in the sandbox against the run's current variables.
pub(crate) fn evaluate_in(scope: &ActionScope<'_>, expression: &str) -> EngineResult<Value> {
    scope.run.with_variables(|variables| expression::evaluate(expression, variables))
}

/// Resolves placeholders in `value` against the run's current variables.
pub(crate) fn resolve_in(scope: &ActionScope<'_>, value: &Value) -> EngineResult<Value> {
    let policy = scope.dispatcher.config().undefined_variables;
    scope.run.with_variables(|variables| resolve_value(value, variables, policy))
}

/// Applies an action's `eval` flag: when set, the value is evaluated as an
/// expression and the raw result replaces it.
pub(crate) fn apply_eval_flag(scope: &ActionScope<'_>, value: Value, eval: bool) -> EngineResult<Value> {
    if !eval {
        return Ok(value);
    }
    match value {
        Value::String(source) => evaluate_in(scope, &source),
        other => evaluate_in(scope, &display_value(&other)),
    }
}

/// Lenient field deserializers for values that arrive as strings after template resolution.
pub(crate) mod lenient {
    use super::*;

    pub fn flag_value(value: &Value) -> Option<bool> {
        match value {
            Value::Bool(flag) => Some(*flag),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" | "" => Some(false),
                _ => None,
            },
            Value::Number(number) => number.as_f64().map(|value| value != 0.0),
            _ => None,
        }
    }

    pub fn number_value(value: &Value) -> Option<f64> {
        match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Accepts booleans, `"true"`/`"false"`-style strings and numbers.
    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => flag_value(&value)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("expected a boolean, got {value}"))),
        }
    }

    /// Accepts numbers and numeric strings.
    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => number_value(&value)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("expected a number, got {value}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Flags {
        #[serde(default, deserialize_with = "lenient::flag")]
        eval: Option<bool>,
        #[serde(default, deserialize_with = "lenient::number")]
        timeout: Option<f64>,
    }

    #[test]
    fn lenient_fields_accept_resolved_strings() {
        let step = Step::from_value(&json!({"action": "x", "eval": "True", "timeout": "2.5"})).expect("step");
        let flags: Flags = parse_fields("x", &step).expect("fields");
        assert_eq!(flags.eval, Some(true));
        assert_eq!(flags.timeout, Some(2.5));
    }

    #[test]
    fn lenient_fields_reject_garbage() {
        let step = Step::from_value(&json!({"action": "x", "timeout": "soon"})).expect("step");
        let error = parse_fields::<Flags>("x", &step).expect_err("invalid");
        assert!(matches!(error, EngineError::InvalidField { .. }));
    }

    #[test]
    fn absent_lenient_fields_default_to_none() {
        let step = Step::from_value(&json!({"action": "x"})).expect("step");
        let flags: Flags = parse_fields("x", &step).expect("fields");
        assert!(flags.eval.is_none() && flags.timeout.is_none());
    }
}
