//! Run status, step outcomes and execution history records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a single run.
///
/// `created → executing(i) → completed | error`. Both terminal states are sticky.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Created,
    /// Dispatching the top-level step at `step_index` (zero based).
    Executing { step_index: usize },
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Executing { step_index } => write!(f, "executing step {}", step_index + 1),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time view of a run for status pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    /// When execution started; `None` while the run is still `created`.
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds since execution started, frozen once the run is terminal.
    pub elapsed_secs: f64,
    /// The outcome that moved the run into `error`, if any.
    pub error: Option<StepOutcome>,
}

/// Per-run sizes reported when listing runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub output_lines: usize,
    pub history_entries: usize,
    pub variable_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    Success,
    Error,
}

/// Stable category tag carried by error outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingAction,
    UnknownAction,
    MissingField,
    InvalidField,
    UnsafeExpression,
    UnsafeCommand,
    CommandTimeout,
    CommandFailed,
    LoopLimitExceeded,
    UndefinedVariable,
    HttpTransport,
    JsonDecode,
    Expression,
    Cancelled,
    DuplicateAction,
    RunNotFound,
    RunAlreadyStarted,
    InvalidScript,
}

impl ErrorKind {
    /// Errors that end a run unconditionally and must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LoopLimitExceeded | Self::UnsafeExpression | Self::UnsafeCommand)
    }

    /// Errors a script author may safely retry by re-running the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandTimeout | Self::HttpTransport)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingAction => "missing_action",
            Self::UnknownAction => "unknown_action",
            Self::MissingField => "missing_field",
            Self::InvalidField => "invalid_field",
            Self::UnsafeExpression => "unsafe_expression",
            Self::UnsafeCommand => "unsafe_command",
            Self::CommandTimeout => "command_timeout",
            Self::CommandFailed => "command_failed",
            Self::LoopLimitExceeded => "loop_limit_exceeded",
            Self::UndefinedVariable => "undefined_variable",
            Self::HttpTransport => "http_transport",
            Self::JsonDecode => "json_decode",
            Self::Expression => "expression",
            Self::Cancelled => "cancelled",
            Self::DuplicateAction => "duplicate_action",
            Self::RunNotFound => "run_not_found",
            Self::RunAlreadyStarted => "run_already_started",
            Self::InvalidScript => "invalid_script",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of dispatching one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub result: OutcomeResult,
    pub message: String,
    /// Action that produced the outcome; `None` when the step had no action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Capped diagnostic text intended for operators, never for end users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Raw value produced by value-returning actions such as `eval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl StepOutcome {
    pub fn success(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            result: OutcomeResult::Success,
            message: message.into(),
            action: Some(action.into()),
            error_kind: None,
            detail: None,
            value: None,
        }
    }

    pub fn error(action: Option<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            result: OutcomeResult::Error,
            message: message.into(),
            action,
            error_kind: Some(kind),
            detail: None,
            value: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.result == OutcomeResult::Success
    }

    pub fn is_error(&self) -> bool {
        self.result == OutcomeResult::Error
    }
}

/// Append-only record of a dispatched step, kept when history logging is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    TimeBased,
    Interval,
    EventBased,
}

impl TriggerType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "time_based" => Some(Self::TimeBased),
            "interval" => Some(Self::Interval),
            "event_based" => Some(Self::EventBased),
            _ => None,
        }
    }
}

/// Deferred intent recorded by a `trigger` step. Scheduling happens elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub trigger_type: TriggerType,
    /// Type-specific setting: the time, the interval in seconds, or the event name.
    pub setting: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    /// The child steps to run when the trigger fires, unresolved.
    pub steps: Vec<Value>,
    pub recorded_at: DateTime<Utc>,
}
