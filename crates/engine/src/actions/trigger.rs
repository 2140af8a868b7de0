//! `trigger`: validates and records a deferred intent. Nothing is scheduled here.

use async_trait::async_trait;
use chrono::Utc;
use runbook_types::{Step, StepOutcome, TriggerRecord, TriggerType};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{lenient, parse_fields};
use crate::{
    dispatch::child_steps,
    error::{EngineError, EngineResult},
    registry::{ActionDescriptor, ActionHandler, ActionScope},
};

const TRIGGER: &str = "trigger";

#[derive(Debug, Deserialize, JsonSchema)]
struct TriggerFields {
    #[serde(rename = "type")]
    #[schemars(description = "One of time_based, interval or event_based")]
    trigger_type: String,
    #[schemars(description = "Steps to run when the trigger fires")]
    steps: Vec<Value>,
    #[schemars(description = "Free-form settings passed to the scheduler")]
    config: Option<Value>,
    #[schemars(description = "When a time_based trigger fires")]
    time: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    #[schemars(description = "Seconds between interval trigger firings")]
    interval: Option<f64>,
    #[schemars(description = "Event name an event_based trigger waits for")]
    event: Option<String>,
}

/// A trigger that passed validation, with its type-specific setting.
struct ValidTrigger {
    fields: TriggerFields,
    trigger_type: TriggerType,
    setting: Value,
    message: String,
}

fn check(step: &Step) -> EngineResult<ValidTrigger> {
    child_steps(step, "steps", TRIGGER)?;
    let fields: TriggerFields = parse_fields(TRIGGER, step)?;
    let trigger_type = TriggerType::parse(&fields.trigger_type).ok_or_else(|| {
        EngineError::invalid_field(
            TRIGGER,
            "type",
            format!("unsupported trigger type '{}'", fields.trigger_type),
        )
    })?;

    let (setting, message) = match trigger_type {
        TriggerType::TimeBased => {
            let time = fields
                .time
                .as_deref()
                .filter(|time| !time.trim().is_empty())
                .ok_or_else(|| EngineError::missing_field("time", TRIGGER))?;
            (json!(time), format!("Trigger time_based scheduled for {time}"))
        }
        TriggerType::Interval => match fields.interval {
            Some(interval) if interval.is_finite() && interval > 0.0 => {
                (json!(interval), format!("Interval trigger set to {interval} seconds"))
            }
            Some(_) => {
                return Err(EngineError::invalid_field(TRIGGER, "interval", "must be a positive number"));
            }
            None => return Err(EngineError::missing_field("interval", TRIGGER)),
        },
        TriggerType::EventBased => {
            let event = fields
                .event
                .as_deref()
                .filter(|event| !event.trim().is_empty())
                .ok_or_else(|| EngineError::missing_field("event", TRIGGER))?;
            (json!(event), format!("Event trigger set for event: {event}"))
        }
    };

    Ok(ValidTrigger {
        fields,
        trigger_type,
        setting,
        message,
    })
}

struct TriggerAction;

#[async_trait]
impl ActionHandler for TriggerAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        check(step).map(|_| ())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let trigger = check(step)?;
        scope.run.record_trigger(TriggerRecord {
            trigger_type: trigger.trigger_type,
            setting: trigger.setting,
            config: trigger.fields.config,
            steps: trigger.fields.steps,
            recorded_at: Utc::now(),
        });
        Ok(StepOutcome::success(TRIGGER, trigger.message))
    }
}

pub(crate) fn descriptor() -> ActionDescriptor {
    ActionDescriptor::new(TRIGGER, "Record a time, interval or event trigger", TriggerAction)
        .required(&["type", "steps"])
        .optional(&["config", "time", "interval", "event"])
        .raw(&["steps"])
        .schema_from::<TriggerFields>()
}

#[cfg(test)]
mod tests {
    use runbook_types::{ErrorKind, RunOptions};

    use super::*;
    use crate::{config::EngineConfig, dispatch::Dispatcher, run::RunContext};

    async fn dispatch(run: &RunContext, step: Value) -> StepOutcome {
        let dispatcher = Dispatcher::with_builtins(EngineConfig::default()).expect("dispatcher");
        dispatcher.dispatch(&Step::from_value(&step).expect("step"), run).await
    }

    fn run() -> RunContext {
        RunContext::new("trigger", RunOptions::default(), &EngineConfig::default())
    }

    #[tokio::test]
    async fn records_triggers_with_unresolved_steps() {
        let run = run();
        run.set_variable("when", json!("09:00"));
        let outcome = dispatch(
            &run,
            json!({
                "action": "trigger",
                "type": "time_based",
                "time": "${when}",
                "steps": [{"action": "print_msg", "message": "${later}"}],
            }),
        )
        .await;
        assert_eq!(outcome.message, "Trigger time_based scheduled for 09:00");

        let triggers = run.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].trigger_type, TriggerType::TimeBased);
        assert_eq!(triggers[0].steps[0]["message"], "${later}");
    }

    #[tokio::test]
    async fn interval_and_event_triggers_need_their_setting() {
        let run = run();
        let outcome = dispatch(&run, json!({"action": "trigger", "type": "interval", "interval": 0, "steps": []})).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidField));

        let outcome = dispatch(&run, json!({"action": "trigger", "type": "event_based", "steps": []})).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::MissingField));

        let outcome = dispatch(
            &run,
            json!({"action": "trigger", "type": "event_based", "event": "deploy", "steps": []}),
        )
        .await;
        assert_eq!(outcome.message, "Event trigger set for event: deploy");
        assert_eq!(run.triggers().len(), 1);
    }

    #[tokio::test]
    async fn unknown_trigger_types_are_invalid() {
        let run = run();
        let outcome = dispatch(&run, json!({"action": "trigger", "type": "cron", "steps": []})).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidField));
        assert!(run.triggers().is_empty());
    }
}
