//! `delay`: suspends the run without blocking other runs.

use async_trait::async_trait;
use runbook_types::{Step, StepOutcome};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{apply_eval_flag, lenient, parse_fields};
use crate::{
    config::secs_to_duration,
    error::{EngineError, EngineResult},
    registry::{ActionDescriptor, ActionHandler, ActionScope},
    resolve::display_value,
};

const DELAY: &str = "delay";

#[derive(Debug, Deserialize, JsonSchema)]
struct DelayFields {
    #[schemars(description = "Seconds to wait; fractions allowed")]
    seconds: Value,
    #[serde(default, deserialize_with = "lenient::flag")]
    #[schemars(description = "Evaluate `seconds` as an expression")]
    eval: Option<bool>,
}

fn parse_seconds(value: &Value) -> EngineResult<f64> {
    match lenient::number_value(value) {
        Some(seconds) if seconds.is_finite() && seconds >= 0.0 => Ok(seconds),
        _ => Err(EngineError::invalid_field(
            DELAY,
            "seconds",
            format!("expected a non-negative number, got {}", display_value(value)),
        )),
    }
}

struct DelayAction;

#[async_trait]
impl ActionHandler for DelayAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        let fields: DelayFields = parse_fields(DELAY, step)?;
        if !fields.eval.unwrap_or(false) {
            parse_seconds(&fields.seconds)?;
        }
        Ok(())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let fields: DelayFields = parse_fields(DELAY, step)?;
        let seconds = parse_seconds(&apply_eval_flag(scope, fields.seconds, fields.eval.unwrap_or(false))?)?;

        tokio::select! {
            _ = scope.run.cancellation_token().cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(secs_to_duration(seconds)) => {
                Ok(StepOutcome::success(DELAY, format!("Delayed for {seconds} seconds")))
            }
        }
    }
}

pub(crate) fn descriptor() -> ActionDescriptor {
    ActionDescriptor::new(DELAY, "Wait for a number of seconds", DelayAction)
        .required(&["seconds"])
        .optional(&["eval"])
        .schema_from::<DelayFields>()
}
