//! Per-run execution context and its status state machine.

use std::{
    sync::{
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use runbook_types::{
    ErrorKind, HistoryEntry, RunOptions, RunStatus, RunSummary, ScriptBody, StatusSnapshot, Step, StepOutcome, TriggerRecord,
};
use serde_json::{Map, Value};
use tokio::sync::{
    broadcast::{
        self,
        error::{RecvError, TryRecvError},
    },
    watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{legacy, output::OutputStream};
use crate::{
    config::EngineConfig,
    dispatch::Dispatcher,
    error::{EngineError, EngineResult},
    variables::VariableStore,
};

#[derive(Debug, Default)]
struct RunState {
    variables: VariableStore,
    history: Vec<HistoryEntry>,
    triggers: Vec<TriggerRecord>,
    last_error: Option<StepOutcome>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished_after: Option<Duration>,
}

/// State owned by one script execution.
///
/// Only the run's own execution task writes variables, history and output;
/// pollers read through snapshot accessors that copy under a short lock.
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    options: RunOptions,
    state: RwLock<RunState>,
    output: OutputStream,
    status: watch::Sender<RunStatus>,
    cancel: CancellationToken,
    launched: AtomicBool,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, options: RunOptions, config: &EngineConfig) -> Self {
        let (status, _) = watch::channel(RunStatus::Created);
        Self {
            run_id: run_id.into(),
            options,
            state: RwLock::new(RunState::default()),
            output: OutputStream::new(config.output_capacity, config.stream_capacity),
            status,
            cancel: CancellationToken::new(),
            launched: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    pub fn log_history(&self) -> bool {
        self.options.log_history
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// A receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let state = self.read();
        let elapsed = match (state.finished_after, state.started) {
            (Some(finished), _) => finished,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        };
        StatusSnapshot {
            run_id: self.run_id.clone(),
            status: self.status(),
            started_at: state.started_at,
            elapsed_secs: elapsed.as_secs_f64(),
            error: state.last_error.clone(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let state = self.read();
        RunSummary {
            run_id: self.run_id.clone(),
            status: self.status(),
            output_lines: self.output.len(),
            history_entries: state.history.len(),
            variable_count: state.variables.len(),
        }
    }

    /// Runs `f` with read access to the variables, without copying them.
    pub fn with_variables<R>(&self, f: impl FnOnce(&VariableStore) -> R) -> R {
        f(&self.read().variables)
    }

    pub fn variables(&self) -> Map<String, Value> {
        self.read().variables.snapshot()
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.read().variables.get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.write().variables.set(name, value);
    }

    pub fn seed_variables(&self, values: Map<String, Value>) {
        self.write().variables.extend(values);
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.read().history.clone()
    }

    pub fn record_history(&self, entry: HistoryEntry) {
        self.write().history.push(entry);
    }

    pub fn clear_history(&self) {
        self.write().history.clear();
    }

    pub fn triggers(&self) -> Vec<TriggerRecord> {
        self.read().triggers.clone()
    }

    pub fn record_trigger(&self, record: TriggerRecord) {
        self.write().triggers.push(record);
    }

    pub fn output(&self) -> &OutputStream {
        &self.output
    }

    /// Appends a line to the run's output.
    pub fn print(&self, line: impl Into<String>) {
        self.output.push(line);
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Asks the run to stop before its next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Executes a script body. A run executes at most once.
    ///
    /// Returns the success message, or the outcome of the step that failed.
    /// Either way the run ends in a terminal status.
    pub async fn execute(&self, dispatcher: &Dispatcher, script: &ScriptBody) -> Result<String, StepOutcome> {
        self.start()
            .map_err(|error| StepOutcome::error(None, error.kind(), error.to_string()))?;
        info!(run_id = %self.run_id, legacy = script.is_legacy(), "run started");

        let result = match script {
            ScriptBody::Steps { steps } => self.execute_steps(dispatcher, steps).await,
            ScriptBody::Legacy(source) => legacy::run_snippet(self, source, dispatcher.config()).await,
        };
        self.finish(&result);
        result
    }

    async fn execute_steps(&self, dispatcher: &Dispatcher, steps: &[Step]) -> Result<String, StepOutcome> {
        for (index, step) in steps.iter().enumerate() {
            self.set_step(index);
            let outcome = dispatcher.dispatch(step, self).await;
            if outcome.is_error() {
                warn!(run_id = %self.run_id, step = index + 1, "Step {} failed: {}", index + 1, outcome.message);
                return Err(outcome);
            }
        }
        Ok(format!("Script executed successfully with {} steps", steps.len()))
    }

    fn start(&self) -> EngineResult<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(EngineError::RunAlreadyStarted {
                run_id: self.run_id.clone(),
            });
        }
        {
            let mut state = self.write();
            state.started_at = Some(Utc::now());
            state.started = Some(Instant::now());
        }
        self.status.send_replace(RunStatus::Executing { step_index: 0 });
        Ok(())
    }

    /// Marks the top-level step (or legacy line) currently executing.
    pub(crate) fn set_step(&self, step_index: usize) {
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = RunStatus::Executing { step_index };
            true
        });
    }

    fn finish(&self, result: &Result<String, StepOutcome>) {
        {
            let mut state = self.write();
            state.finished_after = state.started.map(|started| started.elapsed());
            if let Err(outcome) = result {
                state.last_error = Some(outcome.clone());
            }
        }
        let status = if result.is_ok() { RunStatus::Completed } else { RunStatus::Error };
        self.status.send_replace(status);

        let elapsed_ms = self.status_snapshot().elapsed_secs * 1000.0;
        match result {
            Ok(message) => info!(run_id = %self.run_id, elapsed_ms, "{message}"),
            Err(outcome) if outcome.error_kind == Some(ErrorKind::Cancelled) => {
                info!(run_id = %self.run_id, elapsed_ms, "run cancelled")
            }
            Err(outcome) => info!(
                run_id = %self.run_id,
                elapsed_ms,
                kind = ?outcome.error_kind,
                "run failed"
            ),
        }
    }

    /// Delivers live output lines to `consumer` until the run is terminal or
    /// `timeout` elapses. Returns the number of lines delivered.
    ///
    /// Lines printed before the call are not replayed; read them with
    /// [`OutputStream::lines`].
    pub async fn flush_output(&self, mut consumer: impl FnMut(String), timeout: Duration) -> usize {
        let mut lines = self.output.subscribe();
        let finished = wait_until_terminal(self.watch_status());
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(finished, deadline);
        let mut delivered = 0;

        loop {
            tokio::select! {
                biased;
                received = lines.recv() => match received {
                    Ok(line) => {
                        consumer(line);
                        delivered += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(run_id = %self.run_id, skipped, "output subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut finished => {
                    delivered += drain_buffered(&self.run_id, &mut lines, &mut consumer);
                    break;
                }
                _ = &mut deadline => break,
            }
        }

        delivered
    }
}

/// Delivers every line still buffered for `lines`, stepping over any lag.
fn drain_buffered(run_id: &str, lines: &mut broadcast::Receiver<String>, consumer: &mut impl FnMut(String)) -> usize {
    let mut delivered = 0;
    loop {
        match lines.try_recv() {
            Ok(line) => {
                consumer(line);
                delivered += 1;
            }
            Err(TryRecvError::Lagged(skipped)) => warn!(run_id, skipped, "output subscriber lagged"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => return delivered,
        }
    }
}

async fn wait_until_terminal(mut status: watch::Receiver<RunStatus>) {
    let _ = status.wait_for(RunStatus::is_terminal).await;
}
