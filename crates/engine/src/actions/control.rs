//! Control flow: `condition` and `loop`.
//!
//! Both keep their child step lists raw so every child is resolved against the
//! variables as they stand when that child runs, not when the parent started.

use async_trait::async_trait;
use runbook_types::{Step, StepOutcome};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{evaluate_in, lenient, parse_fields, resolve_in};
use crate::{
    dispatch::child_steps,
    error::{EngineError, EngineResult},
    expression::truthy,
    registry::{ActionDescriptor, ActionHandler, ActionScope},
};

const CONDITION: &str = "condition";
const LOOP: &str = "loop";

/// Evaluates a condition field. Expression text goes through the sandbox;
/// any other JSON value is judged by its truthiness.
fn condition_holds(scope: &ActionScope<'_>, condition: &Value) -> EngineResult<bool> {
    match condition {
        Value::String(expression) => evaluate_in(scope, expression).map(|value| truthy(&value)),
        other => Ok(truthy(other)),
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ConditionFields {
    #[schemars(description = "Expression deciding which branch runs")]
    condition: Value,
    #[schemars(description = "Steps run when the condition holds")]
    if_true: Vec<Value>,
    #[schemars(description = "Steps run otherwise")]
    if_false: Vec<Value>,
}

struct ConditionAction;

#[async_trait]
impl ActionHandler for ConditionAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        child_steps(step, "if_true", CONDITION)?;
        child_steps(step, "if_false", CONDITION)?;
        Ok(())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let condition = step
            .get("condition")
            .ok_or_else(|| EngineError::missing_field("condition", CONDITION))?;
        let result = condition_holds(scope, condition)?;
        let branch = if result { "if_true" } else { "if_false" };
        let steps = child_steps(step, branch, CONDITION)?;

        debug!(run_id = scope.run.run_id(), branch, steps = steps.len(), "condition evaluated");
        if let Err(failure) = scope.dispatcher.run_steps(&steps, scope.run).await {
            return Ok(failure);
        }
        Ok(StepOutcome::success(CONDITION, format!("Condition result: {result}")))
    }
}

pub(crate) fn condition_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(CONDITION, "Run one of two step lists depending on a condition", ConditionAction)
        .required(&["condition", "if_true", "if_false"])
        .raw(&["if_true", "if_false"])
        .schema_from::<ConditionFields>()
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct LoopFields {
    #[schemars(description = "Expression re-resolved and re-evaluated before every iteration")]
    condition: Option<Value>,
    #[serde(default, deserialize_with = "lenient::number")]
    #[schemars(description = "Fixed pass count; sets loop_index to 0, 1, ... instead of checking a condition")]
    iterations: Option<f64>,
    #[schemars(description = "Steps run on each iteration")]
    loop_steps: Vec<Value>,
    #[serde(default, deserialize_with = "lenient::number")]
    #[schemars(description = "Iteration limit overriding the configured default")]
    max_iterations: Option<f64>,
}

/// How a loop decides whether to run another pass.
enum LoopMode<'a> {
    While(&'a Value),
    Counted(usize),
}

fn whole_number(field: &str, raw: f64, minimum: f64) -> EngineResult<usize> {
    if raw.is_finite() && raw >= minimum && raw.fract() == 0.0 {
        return Ok(raw as usize);
    }
    let expected = if minimum > 0.0 { "a positive" } else { "a non-negative" };
    Err(EngineError::invalid_field(LOOP, field, format!("expected {expected} whole number, got {raw}")))
}

struct LoopAction;

impl LoopAction {
    fn limit(fields: &LoopFields, default: usize) -> EngineResult<usize> {
        match fields.max_iterations {
            None => Ok(default),
            Some(limit) => whole_number("max_iterations", limit, 1.0),
        }
    }

    fn mode<'a>(step: &'a Step, fields: &LoopFields) -> EngineResult<LoopMode<'a>> {
        match (step.get("condition"), fields.iterations) {
            (Some(_), Some(_)) => Err(EngineError::invalid_field(
                LOOP,
                "iterations",
                "cannot be combined with condition",
            )),
            (Some(condition), None) => Ok(LoopMode::While(condition)),
            (None, Some(count)) => whole_number("iterations", count, 0.0).map(LoopMode::Counted),
            (None, None) => Err(EngineError::missing_field("condition", LOOP)),
        }
    }
}

#[async_trait]
impl ActionHandler for LoopAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        child_steps(step, "loop_steps", LOOP)?;
        let fields: LoopFields = parse_fields(LOOP, step)?;
        Self::limit(&fields, 1)?;
        Self::mode(step, &fields)?;
        Ok(())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let fields: LoopFields = parse_fields(LOOP, step)?;
        let limit = Self::limit(&fields, scope.dispatcher.config().max_loop_iterations)?;
        let mode = Self::mode(step, &fields)?;
        let steps = child_steps(step, "loop_steps", LOOP)?;

        let mut iterations = 0usize;
        loop {
            if scope.run.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let another_pass = match &mode {
                LoopMode::While(condition) => {
                    let current = resolve_in(scope, condition)?;
                    condition_holds(scope, &current)?
                }
                LoopMode::Counted(count) => iterations < *count,
            };
            if !another_pass {
                break;
            }
            if iterations >= limit {
                return Err(EngineError::LoopLimitExceeded { limit });
            }
            if matches!(mode, LoopMode::Counted(_)) {
                scope.run.set_variable("loop_index", Value::from(iterations));
            }
            if let Err(failure) = scope.dispatcher.run_steps(&steps, scope.run).await {
                return Ok(failure);
            }
            iterations += 1;
        }

        debug!(run_id = scope.run.run_id(), iterations, "loop finished");
        Ok(StepOutcome::success(LOOP, format!("Executed {iterations} iterations")))
    }
}

pub(crate) fn loop_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(LOOP, "Repeat steps while a condition holds, or a fixed number of times", LoopAction)
        .required(&["loop_steps"])
        .optional(&["condition", "iterations", "max_iterations"])
        .raw(&["condition", "loop_steps"])
        .schema_from::<LoopFields>()
}
