//! `print_msg` and `eval`.

use async_trait::async_trait;
use runbook_types::{Step, StepOutcome};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{apply_eval_flag, evaluate_in, lenient, parse_fields};
use crate::{
    error::EngineResult,
    registry::{ActionDescriptor, ActionHandler, ActionScope},
    resolve::display_value,
};

const PRINT_MSG: &str = "print_msg";
const EVAL: &str = "eval";

#[derive(Debug, Deserialize, JsonSchema)]
struct PrintMsgFields {
    #[schemars(description = "Message appended to the run output")]
    message: Value,
    #[serde(default, deserialize_with = "lenient::flag")]
    #[schemars(description = "Evaluate the message as an expression and print the result")]
    eval: Option<bool>,
}

struct PrintMsgAction;

#[async_trait]
impl ActionHandler for PrintMsgAction {
    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let fields: PrintMsgFields = parse_fields(PRINT_MSG, step)?;
        let message = apply_eval_flag(scope, fields.message, fields.eval.unwrap_or(false))?;
        scope.run.print(display_value(&message));
        Ok(StepOutcome::success(PRINT_MSG, "Printed msg"))
    }
}

pub(crate) fn print_msg_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(PRINT_MSG, "Print a message to the run output", PrintMsgAction)
        .required(&["message"])
        .optional(&["eval"])
        .schema_from::<PrintMsgFields>()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EvalFields {
    #[schemars(description = "Sandboxed expression to evaluate")]
    expression: String,
}

struct EvalAction;

#[async_trait]
impl ActionHandler for EvalAction {
    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let fields: EvalFields = parse_fields(EVAL, step)?;
        let value = evaluate_in(scope, &fields.expression)?;
        Ok(StepOutcome::success(EVAL, format!("Expression result: {}", display_value(&value))).with_value(value))
    }
}

pub(crate) fn eval_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(EVAL, "Evaluate an expression and return its value", EvalAction)
        .required(&["expression"])
        .schema_from::<EvalFields>()
}

#[cfg(test)]
mod tests {
    use runbook_types::{ErrorKind, RunOptions, Step, StepOutcome};
    use serde_json::{Value, json};

    use crate::{config::EngineConfig, dispatch::Dispatcher, run::RunContext};

    async fn dispatch(run: &RunContext, step: Value) -> StepOutcome {
        let dispatcher = Dispatcher::with_builtins(EngineConfig::default()).expect("dispatcher");
        dispatcher.dispatch(&Step::from_value(&step).expect("step"), run).await
    }

    #[tokio::test]
    async fn print_msg_writes_display_form() {
        let run = RunContext::new("out", RunOptions::default(), &EngineConfig::default());
        run.set_variable("items", json!([1, 2]));
        dispatch(&run, json!({"action": "print_msg", "message": "items=${items}"})).await;
        dispatch(&run, json!({"action": "print_msg", "message": {"k": "v"}})).await;
        dispatch(&run, json!({"action": "print_msg", "message": "len(items) + 1", "eval": true})).await;
        assert_eq!(run.output().lines(), vec!["items=[1,2]", r#"{"k":"v"}"#, "3"]);
    }

    #[tokio::test]
    async fn eval_returns_value_without_storing_it() {
        let run = RunContext::new("out", RunOptions::default(), &EngineConfig::default());
        run.set_variable("x", json!(5));
        let outcome = dispatch(&run, json!({"action": "eval", "expression": "x > 3 and x < 10"})).await;
        assert_eq!(outcome.value, Some(json!(true)));
        assert_eq!(outcome.message, "Expression result: true");
        assert_eq!(run.variables().len(), 1);
    }

    #[tokio::test]
    async fn eval_rejects_attribute_access() {
        let run = RunContext::new("out", RunOptions::default(), &EngineConfig::default());
        let outcome = dispatch(&run, json!({"action": "eval", "expression": "__class__"})).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::UnsafeExpression));
    }
}
