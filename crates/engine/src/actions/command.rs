//! `execute_command`: runs a host command after the dangerous-command screen.

use std::process::Stdio;

use async_trait::async_trait;
use runbook_types::{Step, StepOutcome};
use runbook_util::split_command_line;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::debug;

use super::{lenient, parse_fields};
use crate::{
    config::secs_to_duration,
    error::{EngineError, EngineResult},
    registry::{ActionDescriptor, ActionHandler, ActionScope},
    resolve::display_value,
};

const EXECUTE_COMMAND: &str = "execute_command";

/// Substrings that reject a command outright. Matched case-insensitively.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    "format",
    "shutdown",
    "reboot",
    "sudo",
    "chmod 777",
    "mkfs",
    "dd if=",
    "> /dev/",
];

/// Fails with an unsafe command error when `command` contains a dangerous pattern.
pub fn screen_command(command: &str) -> EngineResult<()> {
    let lowered = command.to_lowercase();
    match DANGEROUS_PATTERNS.iter().find(|pattern| lowered.contains(*pattern)) {
        Some(pattern) => Err(EngineError::unsafe_command(*pattern)),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExecuteCommandFields {
    /// Command line, or a list of program and arguments.
    command: Value,
    #[serde(default, deserialize_with = "lenient::flag")]
    #[schemars(description = "Run the command through the platform shell")]
    shell: Option<bool>,
    #[serde(default, deserialize_with = "lenient::number")]
    #[schemars(description = "Timeout in seconds")]
    timeout: Option<f64>,
}

/// The command as the user wrote it, normalized from a string or a list.
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn from_value(value: &Value) -> EngineResult<Self> {
        match value {
            Value::String(line) if !line.trim().is_empty() => Ok(Self::Line(line.clone())),
            Value::Array(parts) if !parts.is_empty() => Ok(Self::Argv(parts.iter().map(display_value).collect())),
            _ => Err(EngineError::invalid_field(
                EXECUTE_COMMAND,
                "command",
                "expected a non-empty string or list",
            )),
        }
    }

    /// Text screened against the deny-list and shown in errors.
    fn display(&self) -> String {
        match self {
            Self::Line(line) => line.clone(),
            Self::Argv(parts) => parts.join(" "),
        }
    }

    fn build(&self, shell: bool) -> EngineResult<Command> {
        if shell {
            return Ok(shell_command(&self.display()));
        }
        let argv = match self {
            Self::Line(line) => split_command_line(line).ok_or_else(|| {
                EngineError::invalid_field(EXECUTE_COMMAND, "command", "unbalanced quotes in command line")
            })?,
            Self::Argv(parts) => parts.clone(),
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::invalid_field(EXECUTE_COMMAND, "command", "command is empty"))?;
        let mut command = Command::new(program);
        command.args(args);
        Ok(command)
    }
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

struct ExecuteCommandAction;

#[async_trait]
impl ActionHandler for ExecuteCommandAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        let fields: ExecuteCommandFields = parse_fields(EXECUTE_COMMAND, step)?;
        let spec = CommandSpec::from_value(&fields.command)?;
        screen_command(&spec.display())?;
        if let Some(timeout) = fields.timeout
            && !(timeout.is_finite() && timeout > 0.0)
        {
            return Err(EngineError::invalid_field(EXECUTE_COMMAND, "timeout", "must be a positive number"));
        }
        Ok(())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let fields: ExecuteCommandFields = parse_fields(EXECUTE_COMMAND, step)?;
        let spec = CommandSpec::from_value(&fields.command)?;
        let command_line = spec.display();
        screen_command(&command_line)?;

        let timeout_secs = fields
            .timeout
            .unwrap_or(scope.dispatcher.config().command_timeout_secs);
        let mut command = spec.build(fields.shell.unwrap_or(false))?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(run_id = scope.run.run_id(), command = %command_line, "spawning command");
        let child = command.spawn().map_err(|error| EngineError::CommandFailed {
            command: command_line.clone(),
            reason: error.to_string(),
        })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = scope.run.cancellation_token().cancelled() => return Err(EngineError::Cancelled),
            waited = tokio::time::timeout(secs_to_duration(timeout_secs), child.wait_with_output()) => match waited {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => {
                    return Err(EngineError::CommandFailed { command: command_line, reason: error.to_string() });
                }
                Err(_) => return Err(EngineError::CommandTimeout { command: command_line, timeout_secs }),
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);

        scope.run.print(format!("stdout: {}", stdout.trim_end_matches(['\r', '\n'])));
        scope.run.print(format!("stderr: {}", stderr.trim_end_matches(['\r', '\n'])));
        scope.run.set_variable("exit_code", json!(exit_code));
        scope.run.set_variable("stdout", Value::String(stdout));
        scope.run.set_variable("stderr", Value::String(stderr));

        Ok(StepOutcome::success(
            EXECUTE_COMMAND,
            format!("Command executed with exit code {exit_code}"),
        ))
    }
}

pub(crate) fn descriptor() -> ActionDescriptor {
    ActionDescriptor::new(EXECUTE_COMMAND, "Run a host command and capture its output", ExecuteCommandAction)
        .required(&["command"])
        .optional(&["shell", "timeout"])
        .schema_from::<ExecuteCommandFields>()
}
