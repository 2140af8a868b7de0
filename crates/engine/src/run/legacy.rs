//! Line-oriented interpreter for legacy string script bodies.
//!
//! Each non-blank line that is not a `#` comment is one statement:
//!
//! * `print(a, b, ...)` appends the display form of each argument, space separated
//! * `name = expression` assigns a variable
//! * anything else is evaluated and its value discarded
//!
//! Statements only ever reach the expression sandbox. Every line is screened
//! against both the expression and the command deny-lists first.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use runbook_types::{HistoryEntry, StepOutcome};
use runbook_util::cap_diagnostic;
use serde_json::Value;

use super::RunContext;
use crate::{
    actions::command::screen_command,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    expression::{evaluate, screen_expression},
    resolve::display_value,
};

const LEGACY_ACTION: &str = "legacy_script";

static ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*=([^=].*)$").expect("assignment regex"));
static PRINT_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^print\s*\((.*)\)$").expect("print regex"));

#[derive(Debug, PartialEq)]
enum Statement<'a> {
    Print(&'a str),
    Assign(&'a str, &'a str),
    Expression(&'a str),
}

fn parse_statement(line: &str) -> Statement<'_> {
    if let Some(captures) = PRINT_CALL.captures(line)
        && let Some(arguments) = captures.get(1)
    {
        return Statement::Print(arguments.as_str());
    }
    if let Some(captures) = ASSIGNMENT.captures(line)
        && let (Some(name), Some(expression)) = (captures.get(1), captures.get(2))
    {
        return Statement::Assign(name.as_str(), expression.as_str().trim());
    }
    Statement::Expression(line)
}

/// Runs a legacy snippet against the run's variables and output, yielding to
/// the runtime between statements.
pub(crate) async fn run_snippet(run: &RunContext, source: &str, config: &EngineConfig) -> Result<String, StepOutcome> {
    let mut executed = 0usize;
    for (index, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        tokio::task::yield_now().await;
        if run.is_cancelled() {
            return Err(failure(EngineError::Cancelled, index, config));
        }
        run.set_step(index);

        let outcome = match execute_line(run, line) {
            Ok(message) => StepOutcome::success(LEGACY_ACTION, message),
            Err(error) => failure(error, index, config),
        };
        if run.log_history() {
            run.record_history(HistoryEntry {
                timestamp: Utc::now(),
                action: LEGACY_ACTION.to_string(),
                outcome: outcome.clone(),
            });
        }
        if outcome.is_error() {
            return Err(outcome);
        }
        executed += 1;
    }
    Ok(format!("Legacy script executed successfully with {executed} statements"))
}

fn execute_line(run: &RunContext, line: &str) -> EngineResult<String> {
    screen_expression(line)?;
    screen_command(line)?;

    match parse_statement(line) {
        Statement::Print(arguments) => {
            let values = run.with_variables(|variables| evaluate(&format!("[{arguments}]"), variables))?;
            let text = match values {
                Value::Array(items) => items.iter().map(display_value).collect::<Vec<_>>().join(" "),
                other => display_value(&other),
            };
            run.print(text);
            Ok("Printed msg".to_string())
        }
        Statement::Assign(name, expression) => {
            let value = run.with_variables(|variables| evaluate(expression, variables))?;
            let message = format!("Variable '{name}' set to '{}'", display_value(&value));
            run.set_variable(name, value);
            Ok(message)
        }
        Statement::Expression(expression) => {
            let value = run.with_variables(|variables| evaluate(expression, variables))?;
            Ok(format!("Evaluated to {}", display_value(&value)))
        }
    }
}

fn failure(error: EngineError, index: usize, config: &EngineConfig) -> StepOutcome {
    let detail = cap_diagnostic(&format!("{error:?}"), config.diagnostic_limit);
    StepOutcome::error(
        Some(LEGACY_ACTION.to_string()),
        error.kind(),
        format!("line {}: {error}", index + 1),
    )
    .with_detail(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbook_types::{ErrorKind, RunOptions};
    use serde_json::json;

    fn run() -> RunContext {
        RunContext::new("legacy", RunOptions { log_history: true }, &EngineConfig::default())
    }

    #[test]
    fn statements_are_classified() {
        assert_eq!(parse_statement("print('a', x)"), Statement::Print("'a', x"));
        assert_eq!(parse_statement("total = a + 1"), Statement::Assign("total", "a + 1"));
        assert_eq!(parse_statement("a == 1"), Statement::Expression("a == 1"));
    }

    #[tokio::test]
    async fn snippet_assigns_and_prints() {
        let run = run();
        let source = "# greet\ncount = 2\n\ncount = count * 3\nprint('count is', count)\ncount > 1\n";
        let message = run_snippet(&run, source, &EngineConfig::default()).await.expect("snippet runs");
        assert_eq!(message, "Legacy script executed successfully with 4 statements");
        assert_eq!(run.variable("count"), Some(json!(6)));
        assert_eq!(run.output().lines(), vec!["count is 6"]);
        assert_eq!(run.history().len(), 4);
    }

    #[tokio::test]
    async fn host_access_is_rejected_before_evaluation() {
        let run = run();
        let failure = run_snippet(&run, "x = 1\nimport os\nx = 2", &EngineConfig::default()).await.expect_err("unsafe");
        assert_eq!(failure.error_kind, Some(ErrorKind::UnsafeExpression));
        assert!(failure.message.starts_with("line 2:"));
        assert_eq!(run.variable("x"), Some(json!(1)));
    }

    #[tokio::test]
    async fn dangerous_commands_are_rejected() {
        let run = run();
        let failure = run_snippet(&run, "cmd = 'sudo reboot'", &EngineConfig::default()).await.expect_err("unsafe");
        assert_eq!(failure.error_kind, Some(ErrorKind::UnsafeCommand));
        assert_eq!(run.variable("cmd"), None);
    }

    #[tokio::test]
    async fn long_snippets_yield_and_observe_cancellation() {
        let run = run();
        let source = "x = 1\nx = 2\nx = 3\n";
        let config = EngineConfig::default();
        let (result, _) = tokio::join!(run_snippet(&run, source, &config), async {
            tokio::task::yield_now().await;
            run.cancel();
        });
        let failure = result.expect_err("cancelled between statements");
        assert_eq!(failure.error_kind, Some(ErrorKind::Cancelled));
        assert_ne!(run.variable("x"), Some(json!(3)));
    }
}
