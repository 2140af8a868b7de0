//! Static checks over a script body. Nothing is resolved or executed.

use runbook_types::{ErrorKind, ScriptBody, Step};
use serde::Serialize;
use serde_json::Value;

use crate::{actions::command::screen_command, error::EngineError, expression::screen_expression, registry::ActionRegistry};

/// Fields whose value is a nested step list.
const CHILD_STEP_FIELDS: &[&str] = &["if_true", "if_false", "loop_steps", "steps"];

/// One problem found in a script, located by a path such as `steps[2].if_true[0]`
/// or, for legacy snippets, `line 4`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, error: EngineError) -> Self {
        Self {
            path: path.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Checks every step for a known action and its required fields, recursing
/// into nested step lists. Legacy snippets are screened line by line.
pub fn validate_script(registry: &ActionRegistry, script: &ScriptBody) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    match script {
        ScriptBody::Steps { steps } => validate_steps(registry, steps, "steps", &mut issues),
        ScriptBody::Legacy(source) => {
            for (index, line) in source.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Err(error) = screen_expression(line).and_then(|()| screen_command(line)) {
                    issues.push(ValidationIssue::new(format!("line {}", index + 1), error));
                }
            }
        }
    }
    issues
}

fn validate_steps(registry: &ActionRegistry, steps: &[Step], path: &str, issues: &mut Vec<ValidationIssue>) {
    for (index, step) in steps.iter().enumerate() {
        validate_step(registry, step, &format!("{path}[{index}]"), issues);
    }
}

fn validate_step(registry: &ActionRegistry, step: &Step, path: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(name) = step.action() else {
        issues.push(ValidationIssue::new(path, EngineError::MissingAction));
        return;
    };
    let descriptor = match registry.lookup(name) {
        Ok(descriptor) => descriptor,
        Err(error) => {
            issues.push(ValidationIssue::new(path, error));
            return;
        }
    };
    if let Some(field) = descriptor.missing_field(step) {
        issues.push(ValidationIssue::new(path, EngineError::missing_field(field, name)));
    }

    for field in CHILD_STEP_FIELDS.iter().filter(|field| descriptor.declares(field)) {
        let child_path = format!("{path}.{field}");
        match step.child_steps(field) {
            Some(Ok(children)) => validate_steps(registry, &children, &child_path, issues),
            Some(Err(entry)) => {
                let reason = match step.get(field) {
                    Some(Value::Array(_)) => format!("entry {entry} is not a step object"),
                    _ => "expected a list of steps".to_string(),
                };
                issues.push(ValidationIssue::new(child_path, EngineError::invalid_field(name, *field, reason)));
            }
            None => {}
        }
    }
}
