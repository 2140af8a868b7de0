//! `set_var` and `combine_data`: actions that only touch the variable store.

use async_trait::async_trait;
use runbook_types::{Step, StepOutcome};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{apply_eval_flag, lenient, parse_fields};
use crate::{
    error::{EngineError, EngineResult},
    registry::{ActionDescriptor, ActionHandler, ActionScope},
    resolve::display_value,
    variables::is_identifier,
};

const SET_VAR: &str = "set_var";
const COMBINE_DATA: &str = "combine_data";
const DEFAULT_COMBINE_TARGET: &str = "combined_data";

#[derive(Debug, Deserialize, JsonSchema)]
struct SetVarFields {
    #[schemars(description = "Variable name; must be an identifier")]
    name: String,
    #[schemars(description = "Value to store, after placeholder resolution")]
    value: Value,
    #[serde(default, deserialize_with = "lenient::flag")]
    #[schemars(description = "Evaluate the value as an expression and store the result")]
    eval: Option<bool>,
}

struct SetVarAction;

#[async_trait]
impl ActionHandler for SetVarAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        let fields: SetVarFields = parse_fields(SET_VAR, step)?;
        if !is_identifier(&fields.name) {
            return Err(EngineError::invalid_field(
                SET_VAR,
                "name",
                format!("'{}' is not a valid variable name", fields.name),
            ));
        }
        Ok(())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let fields: SetVarFields = parse_fields(SET_VAR, step)?;
        let value = apply_eval_flag(scope, fields.value, fields.eval.unwrap_or(false))?;
        let message = format!("Variable '{}' set to '{}'", fields.name, display_value(&value));
        scope.run.set_variable(fields.name, value);
        Ok(StepOutcome::success(SET_VAR, message))
    }
}

pub(crate) fn set_var_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(SET_VAR, "Set a variable", SetVarAction)
        .required(&["name", "value"])
        .optional(&["eval"])
        .schema_from::<SetVarFields>()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CombineDataFields {
    /// Variable names holding objects, or inline objects, merged left to right.
    data_sources: Vec<Value>,
    #[schemars(description = "Variable receiving the merged object")]
    output_var: Option<String>,
}

struct CombineDataAction;

impl CombineDataAction {
    fn merge_source(scope: &ActionScope<'_>, combined: &mut Map<String, Value>, source: &Value) -> EngineResult<()> {
        match source {
            Value::Object(inline) => {
                combined.extend(inline.iter().map(|(key, value)| (key.clone(), value.clone())));
                Ok(())
            }
            Value::String(name) => match scope.run.variable(name) {
                Some(Value::Object(stored)) => {
                    combined.extend(stored);
                    Ok(())
                }
                Some(other) => Err(EngineError::invalid_field(
                    COMBINE_DATA,
                    "data_sources",
                    format!("variable '{name}' holds {}, not an object", crate::expression::type_name(&other)),
                )),
                None => Err(EngineError::undefined_variable(name.clone())),
            },
            other => Err(EngineError::invalid_field(
                COMBINE_DATA,
                "data_sources",
                format!("expected a variable name or an object, got {other}"),
            )),
        }
    }
}

#[async_trait]
impl ActionHandler for CombineDataAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        let fields: CombineDataFields = parse_fields(COMBINE_DATA, step)?;
        if let Some(target) = fields.output_var.as_deref()
            && !is_identifier(target)
        {
            return Err(EngineError::invalid_field(
                COMBINE_DATA,
                "output_var",
                format!("'{target}' is not a valid variable name"),
            ));
        }
        Ok(())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let fields: CombineDataFields = parse_fields(COMBINE_DATA, step)?;
        let mut combined = Map::new();
        for source in &fields.data_sources {
            Self::merge_source(scope, &mut combined, source)?;
        }
        let target = fields.output_var.unwrap_or_else(|| DEFAULT_COMBINE_TARGET.to_string());
        scope.run.set_variable(target.clone(), Value::Object(combined));
        Ok(StepOutcome::success(COMBINE_DATA, format!("Combined data saved to {target}")))
    }
}

pub(crate) fn combine_data_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(COMBINE_DATA, "Merge objects from variables and inline data", CombineDataAction)
        .required(&["data_sources"])
        .optional(&["output_var"])
        .schema_from::<CombineDataFields>()
}

#[cfg(test)]
mod tests {
    use runbook_types::{ErrorKind, RunOptions};
    use serde_json::json;

    use crate::{config::EngineConfig, dispatch::Dispatcher, run::RunContext};

    async fn dispatch(run: &RunContext, step: serde_json::Value) -> runbook_types::StepOutcome {
        let dispatcher = Dispatcher::with_builtins(EngineConfig::default()).expect("dispatcher");
        let step = runbook_types::Step::from_value(&step).expect("step");
        dispatcher.dispatch(&step, run).await
    }

    fn run() -> RunContext {
        RunContext::new("data", RunOptions::default(), &EngineConfig::default())
    }

    #[tokio::test]
    async fn set_var_stores_resolved_value() {
        let run = run();
        run.set_variable("who", json!("ops"));
        let outcome = dispatch(&run, json!({"action": "set_var", "name": "greeting", "value": "hi ${who}"})).await;
        assert_eq!(outcome.message, "Variable 'greeting' set to 'hi ops'");
        assert_eq!(run.variable("greeting"), Some(json!("hi ops")));
    }

    #[tokio::test]
    async fn set_var_eval_stores_typed_result() {
        let run = run();
        run.set_variable("n", json!(4));
        let outcome = dispatch(&run, json!({"action": "set_var", "name": "m", "value": "n * 2", "eval": true})).await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(run.variable("m"), Some(json!(8)));
    }

    #[tokio::test]
    async fn set_var_rejects_non_identifier_names() {
        let run = run();
        let outcome = dispatch(&run, json!({"action": "set_var", "name": "1bad", "value": 1})).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidField));
        assert!(run.variables().is_empty());
    }

    #[tokio::test]
    async fn combine_data_merges_left_to_right() {
        let run = run();
        run.set_variable("base", json!({"a": 1, "b": 1}));
        let outcome = dispatch(
            &run,
            json!({"action": "combine_data", "data_sources": ["base", {"b": 2, "c": 3}], "output_var": "merged"}),
        )
        .await;
        assert_eq!(outcome.message, "Combined data saved to merged");
        assert_eq!(run.variable("merged"), Some(json!({"a": 1, "b": 2, "c": 3})));
    }

    #[tokio::test]
    async fn combine_data_defaults_target_and_rejects_missing_sources() {
        let run = run();
        let outcome = dispatch(&run, json!({"action": "combine_data", "data_sources": [{"x": true}]})).await;
        assert!(outcome.is_success());
        assert_eq!(run.variable("combined_data"), Some(json!({"x": true})));

        let outcome = dispatch(&run, json!({"action": "combine_data", "data_sources": ["ghost"]})).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::UndefinedVariable));
    }
}
