//! Script bodies and steps as produced by the persistence layer.
//!
//! A script is either a JSON document of the shape `{"steps": [...]}` or, for
//! legacy content, a bare string snippet. Steps keep every authored field so
//! action handlers can read their action-specific options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single declarative instruction identified by its `action` field.
///
/// Steps are immutable input. Child step lists (`if_true`, `if_false`,
/// `loop_steps`, `steps`) stay embedded as raw JSON until a control-flow
/// action asks for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Step(Map<String, Value>);

impl Step {
    /// Wraps an ordered field map.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Builds a step from a JSON value, returning `None` for non-objects.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(|fields| Self(fields.clone()))
    }

    /// The declared action name, if present and a string.
    pub fn action(&self) -> Option<&str> {
        self.0.get("action").and_then(Value::as_str).filter(|name| !name.trim().is_empty())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Returns the embedded child step list stored under `field`.
    ///
    /// `None` when the field is absent; `Some(Err(index))` names the first
    /// entry that is not an object.
    pub fn child_steps(&self, field: &str) -> Option<Result<Vec<Step>, usize>> {
        let value = self.0.get(field)?;
        let Value::Array(entries) = value else {
            return Some(Err(0));
        };
        let mut steps = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match Step::from_value(entry) {
                Some(step) => steps.push(step),
                None => return Some(Err(index)),
            }
        }
        Some(Ok(steps))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Step {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// The body of a stored script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptBody {
    /// Declarative step list: `{"steps": [...]}`. A missing `steps` key is an empty script.
    Steps {
        #[serde(default)]
        steps: Vec<Step>,
    },
    /// Opaque legacy snippet, interpreted by the sandboxed snippet runner.
    Legacy(String),
}

impl ScriptBody {
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self::Steps { steps }
    }

    /// Interprets stored script text.
    ///
    /// JSON objects become step lists, JSON strings and any non-JSON text
    /// become legacy snippets.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('"') {
            return serde_json::from_str(text);
        }
        Ok(Self::Legacy(text.to_string()))
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

/// Per-run options supplied when a run is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Append an entry to the execution history for every dispatched step.
    #[serde(default)]
    pub log_history: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_body_parses_step_document() {
        let body: ScriptBody = serde_json::from_value(json!({
            "steps": [{"action": "set_var", "name": "a", "value": "1"}]
        }))
        .expect("step document");
        let ScriptBody::Steps { steps } = body else {
            panic!("expected steps");
        };
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action(), Some("set_var"));
        assert_eq!(steps[0].get("name"), Some(&json!("a")));
    }

    #[test]
    fn script_body_treats_plain_text_as_legacy() {
        let body = ScriptBody::from_text("print('hello world')").expect("legacy");
        assert_eq!(body, ScriptBody::Legacy("print('hello world')".into()));

        let body = ScriptBody::from_text("\"x = 1\"").expect("json string");
        assert!(body.is_legacy());
    }

    #[test]
    fn missing_steps_key_is_an_empty_script() {
        let body = ScriptBody::from_text("{}").expect("empty object");
        assert_eq!(body, ScriptBody::from_steps(vec![]));
    }

    #[test]
    fn yaml_documents_deserialize_into_steps() {
        let body: ScriptBody = serde_yaml::from_str(
            r#"
steps:
  - action: print_msg
    message: hello
"#,
        )
        .expect("yaml script");
        assert!(!body.is_legacy());
    }

    #[test]
    fn child_steps_reports_non_object_entries() {
        let step = Step::from_value(&json!({
            "action": "loop",
            "loop_steps": [{"action": "print_msg", "message": "x"}, 3]
        }))
        .expect("step");
        assert_eq!(step.child_steps("loop_steps"), Some(Err(1)));
        assert_eq!(step.child_steps("missing"), None);
    }
}
