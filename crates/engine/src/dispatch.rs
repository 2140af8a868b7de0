//! Step dispatch: validation, template resolution, handler invocation and history.

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use futures_util::{FutureExt, future::BoxFuture};
use runbook_types::{HistoryEntry, Step, StepOutcome};
use runbook_util::{cap_diagnostic, redact_sensitive};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    registry::{ActionDescriptor, ActionRegistry, ActionScope},
    resolve::resolve_value,
    run::RunContext,
};

/// Runs steps against a run context using a shared, read-only action registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ActionRegistry>,
    config: Arc<EngineConfig>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ActionRegistry>, config: Arc<EngineConfig>) -> Self {
        Self { registry, config }
    }

    /// A dispatcher over the built-in actions.
    pub fn with_builtins(config: EngineConfig) -> EngineResult<Self> {
        Ok(Self::new(Arc::new(ActionRegistry::with_builtins()?), Arc::new(config)))
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatches one step and returns its outcome. Errors never escape as `Err`.
    ///
    /// When history logging is on, every step that reached its handler is
    /// recorded with its outcome, whether it succeeded or not.
    pub async fn dispatch(&self, step: &Step, run: &RunContext) -> StepOutcome {
        let timestamp = Utc::now();
        let started = Instant::now();

        let (descriptor, resolved) = match self.prepare(step, run) {
            Ok(prepared) => prepared,
            Err(error) => return self.error_outcome(step.action().map(str::to_string), error, run),
        };

        let scope = ActionScope { run, dispatcher: self };
        let outcome = match descriptor.handler.execute(&resolved, &scope).await {
            Ok(outcome) => outcome,
            Err(error) => self.error_outcome(Some(descriptor.name.clone()), error, run),
        };

        if run.log_history() {
            run.record_history(HistoryEntry {
                timestamp,
                action: descriptor.name.clone(),
                outcome: outcome.clone(),
            });
        }

        debug!(
            run_id = run.run_id(),
            action = descriptor.name.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = outcome.is_success(),
            "step dispatched"
        );
        outcome
    }

    /// Dispatches `steps` in order, stopping at the first error outcome.
    ///
    /// Returns the number of steps run. Boxed because actions such as
    /// `condition` and `loop` call back into it for their child steps.
    pub fn run_steps<'a>(&'a self, steps: &'a [Step], run: &'a RunContext) -> BoxFuture<'a, Result<usize, StepOutcome>> {
        async move {
            for step in steps {
                let outcome = self.dispatch(step, run).await;
                if outcome.is_error() {
                    return Err(outcome);
                }
            }
            Ok(steps.len())
        }
        .boxed()
    }

    fn prepare<'a>(&'a self, step: &Step, run: &RunContext) -> EngineResult<(&'a ActionDescriptor, Step)> {
        if run.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let name = step.action().ok_or(EngineError::MissingAction)?;
        let descriptor = self.registry.lookup(name)?;
        if let Some(field) = descriptor.missing_field(step) {
            return Err(EngineError::missing_field(field, name));
        }

        let resolved = run.with_variables(|variables| -> EngineResult<Step> {
            let mut fields = Map::new();
            fields.insert("action".to_string(), Value::String(name.to_string()));
            for (field, value) in step.fields() {
                if !descriptor.declares(field) {
                    continue;
                }
                let value = if descriptor.is_raw(field) {
                    value.clone()
                } else {
                    resolve_value(value, variables, self.config.undefined_variables)?
                };
                fields.insert(field.clone(), value);
            }
            Ok(Step::new(fields))
        })?;

        descriptor.handler.validate(&resolved)?;
        Ok((descriptor, resolved))
    }

    fn error_outcome(&self, action: Option<String>, error: EngineError, run: &RunContext) -> StepOutcome {
        let message = error.to_string();
        warn!(
            run_id = run.run_id(),
            action = action.as_deref().unwrap_or("<none>"),
            kind = %error.kind(),
            "step failed: {}",
            redact_sensitive(&message)
        );
        let detail = cap_diagnostic(&format!("{error:?}"), self.config.diagnostic_limit);
        StepOutcome::error(action, error.kind(), message).with_detail(detail)
    }
}

/// Reads the child step list stored under `field` of an unresolved step.
pub fn child_steps(step: &Step, field: &str, action: &str) -> EngineResult<Vec<Step>> {
    match step.child_steps(field) {
        Some(Ok(steps)) => Ok(steps),
        Some(Err(index)) => Err(EngineError::invalid_field(
            action,
            field,
            format!("expected a list of step objects (entry {index} is not an object)"),
        )),
        None => Err(EngineError::missing_field(field, action)),
    }
}
