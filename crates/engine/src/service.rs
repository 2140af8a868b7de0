//! Service Registry and the `ScriptService` facade consumed by front ends.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use runbook_types::{ActionMetadata, HistoryEntry, RunOptions, RunSummary, ScriptBody, StatusSnapshot, TriggerRecord};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    dispatch::Dispatcher,
    error::{EngineError, EngineResult},
    run::RunContext,
    validate::{ValidationIssue, validate_script},
};

/// Runs known to this process, keyed by run id.
///
/// Entries are added only by [`ServiceRegistry::create`] and removed only by
/// [`ServiceRegistry::delete`]; a finished run stays until someone deletes it.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    runs: RwLock<HashMap<String, Arc<RunContext>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh run under a random id.
    pub fn create(&self, options: RunOptions, config: &EngineConfig) -> Arc<RunContext> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let mut run_id = Uuid::new_v4().to_string();
        while runs.contains_key(&run_id) {
            run_id = Uuid::new_v4().to_string();
        }
        let run = Arc::new(RunContext::new(run_id.clone(), options, config));
        runs.insert(run_id, Arc::clone(&run));
        run
    }

    pub fn get(&self, run_id: &str) -> EngineResult<Arc<RunContext>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::run_not_found(run_id))
    }

    /// Removes a run and cancels whatever it is still doing. Returns false
    /// when the id is unknown.
    pub fn delete(&self, run_id: &str) -> bool {
        let removed = self.runs.write().unwrap_or_else(PoisonError::into_inner).remove(run_id);
        match removed {
            Some(run) => {
                run.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of every registered run, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn all(&self) -> Vec<Arc<RunContext>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Entry point for callers that create, observe and delete runs.
#[derive(Debug, Clone)]
pub struct ScriptService {
    dispatcher: Dispatcher,
    registry: Arc<ServiceRegistry>,
}

impl ScriptService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            registry: Arc::new(ServiceRegistry::new()),
        }
    }

    /// A service over the built-in actions.
    pub fn with_builtins(config: EngineConfig) -> EngineResult<Self> {
        Ok(Self::new(Dispatcher::with_builtins(config)?))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Creates a run, seeds its variables and starts executing it in the
    /// background. Returns the run id at once.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create_run(&self, script: ScriptBody, initial_variables: Map<String, Value>, options: RunOptions) -> String {
        let run = self.registry.create(options, self.dispatcher.config());
        run.seed_variables(initial_variables);
        let run_id = run.run_id().to_string();
        info!(run_id = %run_id, legacy = script.is_legacy(), "run created");

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let result = run.execute(&dispatcher, &script).await;
            debug!(run_id = run.run_id(), success = result.is_ok(), "run task finished");
        });
        run_id
    }

    pub fn get_run(&self, run_id: &str) -> EngineResult<Arc<RunContext>> {
        self.registry.get(run_id)
    }

    pub fn get_status(&self, run_id: &str) -> EngineResult<StatusSnapshot> {
        Ok(self.registry.get(run_id)?.status_snapshot())
    }

    /// Waits until the run is completed or errored and returns its final status.
    pub async fn wait_for_completion(&self, run_id: &str) -> EngineResult<StatusSnapshot> {
        let run = self.registry.get(run_id)?;
        let mut status = run.watch_status();
        // The sender lives inside the run we hold, so the channel cannot close here.
        let _ = status.wait_for(|status| status.is_terminal()).await;
        Ok(run.status_snapshot())
    }

    pub fn get_variables(&self, run_id: &str) -> EngineResult<Map<String, Value>> {
        Ok(self.registry.get(run_id)?.variables())
    }

    pub fn get_output(&self, run_id: &str) -> EngineResult<Vec<String>> {
        Ok(self.registry.get(run_id)?.output().lines())
    }

    pub fn clear_output(&self, run_id: &str) -> EngineResult<()> {
        self.registry.get(run_id)?.output().clear();
        Ok(())
    }

    pub fn subscribe_output(&self, run_id: &str) -> EngineResult<broadcast::Receiver<String>> {
        Ok(self.registry.get(run_id)?.output().subscribe())
    }

    pub fn get_history(&self, run_id: &str) -> EngineResult<Vec<HistoryEntry>> {
        Ok(self.registry.get(run_id)?.history())
    }

    pub fn clear_history(&self, run_id: &str) -> EngineResult<()> {
        self.registry.get(run_id)?.clear_history();
        Ok(())
    }

    pub fn get_triggers(&self, run_id: &str) -> EngineResult<Vec<TriggerRecord>> {
        Ok(self.registry.get(run_id)?.triggers())
    }

    /// Deletes a run, cancelling it if it is still executing.
    pub fn delete_run(&self, run_id: &str) -> bool {
        let deleted = self.registry.delete(run_id);
        if deleted {
            info!(run_id, "run deleted");
        }
        deleted
    }

    pub fn list_runs(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Every run with its output, history and variable counts, sorted by id.
    pub fn run_ids_with_sizes(&self) -> Vec<RunSummary> {
        let mut summaries: Vec<RunSummary> = self.registry.all().iter().map(|run| run.summary()).collect();
        summaries.sort_by(|left, right| left.run_id.cmp(&right.run_id));
        summaries
    }

    pub fn list_action_metadata(&self) -> Vec<ActionMetadata> {
        self.dispatcher.registry().metadata()
    }

    pub fn validate_script(&self, script: &ScriptBody) -> Vec<ValidationIssue> {
        validate_script(self.dispatcher.registry(), script)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use runbook_types::RunStatus;
    use serde_json::json;

    use super::*;

    #[test]
    fn registry_ids_are_unique_and_deletion_cancels() {
        let registry = ServiceRegistry::new();
        let config = EngineConfig::default();
        let ids: HashSet<String> = (0..64)
            .map(|_| registry.create(RunOptions::default(), &config).run_id().to_string())
            .collect();
        assert_eq!(ids.len(), 64);

        let run_id = registry.list()[0].clone();
        let run = registry.get(&run_id).expect("registered");
        assert!(registry.delete(&run_id));
        assert!(run.is_cancelled());
        assert!(!registry.delete(&run_id));
        assert!(matches!(registry.get(&run_id), Err(EngineError::RunNotFound { .. })));
    }

    #[tokio::test]
    async fn created_runs_execute_in_the_background() {
        let service = ScriptService::with_builtins(EngineConfig::default()).expect("service");
        let script = ScriptBody::from_text(r#"{"steps": [{"action": "print_msg", "message": "hi ${name}"}]}"#)
            .expect("script");
        let mut initial = Map::new();
        initial.insert("name".into(), json!("there"));

        let run_id = service.create_run(script, initial, RunOptions { log_history: true });
        let status = service.wait_for_completion(&run_id).await.expect("run exists");
        assert_eq!(status.status, RunStatus::Completed);
        assert_eq!(service.get_output(&run_id).expect("output"), vec!["hi there"]);
        assert_eq!(service.get_history(&run_id).expect("history").len(), 1);

        service.clear_output(&run_id).expect("clear");
        service.clear_history(&run_id).expect("clear");
        let sizes = service.run_ids_with_sizes();
        assert_eq!(sizes.len(), 1);
        assert_eq!((sizes[0].output_lines, sizes[0].history_entries, sizes[0].variable_count), (0, 0, 1));
    }

    #[tokio::test]
    async fn unknown_runs_are_not_found() {
        let service = ScriptService::with_builtins(EngineConfig::default()).expect("service");
        assert!(matches!(service.get_status("missing"), Err(EngineError::RunNotFound { .. })));
        assert!(!service.delete_run("missing"));
        assert_eq!(service.list_action_metadata().len(), 10);
    }
}
