//! Error taxonomy for script execution.

use runbook_types::ErrorKind;
use thiserror::Error;

/// Errors raised while validating or executing a script.
///
/// Dispatch converts every error into an error [`runbook_types::StepOutcome`]
/// tagged with [`EngineError::kind`], so a raw error never escapes a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Action type is required")]
    MissingAction,

    #[error("Unsupported action type: {name}")]
    UnknownAction { name: String },

    #[error("Missing required option '{field}' for action '{action}'")]
    MissingField { action: String, field: String },

    #[error("Invalid option '{field}' for action '{action}': {reason}")]
    InvalidField { action: String, field: String, reason: String },

    #[error("Expression contains potentially dangerous operations: {reason}")]
    UnsafeExpression { reason: String },

    #[error("Command contains potentially dangerous operations: '{pattern}'")]
    UnsafeCommand { pattern: String },

    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: f64 },

    #[error("Command could not be started: {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Loop exceeded the maximum of {limit} iterations")]
    LoopLimitExceeded { limit: usize },

    #[error("Undefined variable: {name}")]
    UndefinedVariable { name: String },

    #[error("HTTP request failed: {reason}")]
    HttpTransport { reason: String },

    #[error("Failed to decode JSON response: {reason}")]
    JsonDecode { reason: String },

    #[error("Invalid expression: {reason}")]
    Expression { reason: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Action already registered: {name}")]
    DuplicateAction { name: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run already started: {run_id}")]
    RunAlreadyStarted { run_id: String },

    #[error("Invalid script: {reason}")]
    InvalidScript { reason: String },
}

impl EngineError {
    pub fn unknown_action(name: impl Into<String>) -> Self {
        Self::UnknownAction { name: name.into() }
    }

    pub fn missing_field(field: impl Into<String>, action: impl Into<String>) -> Self {
        Self::MissingField {
            action: action.into(),
            field: field.into(),
        }
    }

    pub fn invalid_field(action: impl Into<String>, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            action: action.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unsafe_expression(reason: impl Into<String>) -> Self {
        Self::UnsafeExpression { reason: reason.into() }
    }

    pub fn unsafe_command(pattern: impl Into<String>) -> Self {
        Self::UnsafeCommand { pattern: pattern.into() }
    }

    pub fn undefined_variable(name: impl Into<String>) -> Self {
        Self::UndefinedVariable { name: name.into() }
    }

    pub fn expression(reason: impl Into<String>) -> Self {
        Self::Expression { reason: reason.into() }
    }

    pub fn http_transport(reason: impl Into<String>) -> Self {
        Self::HttpTransport { reason: reason.into() }
    }

    pub fn json_decode(reason: impl Into<String>) -> Self {
        Self::JsonDecode { reason: reason.into() }
    }

    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        Self::RunNotFound { run_id: run_id.into() }
    }

    pub fn invalid_script(reason: impl Into<String>) -> Self {
        Self::InvalidScript { reason: reason.into() }
    }

    /// The stable category tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingAction => ErrorKind::MissingAction,
            Self::UnknownAction { .. } => ErrorKind::UnknownAction,
            Self::MissingField { .. } => ErrorKind::MissingField,
            Self::InvalidField { .. } => ErrorKind::InvalidField,
            Self::UnsafeExpression { .. } => ErrorKind::UnsafeExpression,
            Self::UnsafeCommand { .. } => ErrorKind::UnsafeCommand,
            Self::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::LoopLimitExceeded { .. } => ErrorKind::LoopLimitExceeded,
            Self::UndefinedVariable { .. } => ErrorKind::UndefinedVariable,
            Self::HttpTransport { .. } => ErrorKind::HttpTransport,
            Self::JsonDecode { .. } => ErrorKind::JsonDecode,
            Self::Expression { .. } => ErrorKind::Expression,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DuplicateAction { .. } => ErrorKind::DuplicateAction,
            Self::RunNotFound { .. } => ErrorKind::RunNotFound,
            Self::RunAlreadyStarted { .. } => ErrorKind::RunAlreadyStarted,
            Self::InvalidScript { .. } => ErrorKind::InvalidScript,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
