//! # Runbook Engine
//!
//! Executes declarative automation scripts: ordered lists of steps, each
//! naming an action (`set_var`, `execute_command`, `http_request`, ...) plus
//! that action's fields. Steps run sequentially within a run while many runs
//! proceed concurrently on the Tokio runtime.
//!
//! ## Usage
//!
//! ```rust
//! use runbook_engine::{EngineConfig, RunContext, ScriptBody, Dispatcher, RunOptions};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let dispatcher = Dispatcher::with_builtins(EngineConfig::default())?;
//! let run = RunContext::new("docs", RunOptions::default(), dispatcher.config());
//! let script = ScriptBody::from_text(r#"{"steps": [
//!     {"action": "set_var", "name": "who", "value": "world"},
//!     {"action": "print_msg", "message": "hello ${who}"}
//! ]}"#)?;
//!
//! let message = run.execute(&dispatcher, &script).await.expect("script succeeds");
//! assert_eq!(message, "Script executed successfully with 2 steps");
//! assert_eq!(run.output().lines(), vec!["hello world"]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```
//!
//! ## Architecture
//!
//! - **`registry`**: action names mapped to handlers and field metadata
//! - **`dispatch`**: validates, resolves and runs one step at a time
//! - **`resolve`**: `${name}` placeholder substitution
//! - **`expression`**: the sandboxed expression language
//! - **`actions`**: the built-in actions
//! - **`run`**: per-run state, status machine, output stream and legacy snippets
//! - **`service`**: the registry of live runs and the `ScriptService` facade

use std::{fs, path::Path};

use anyhow::{Context, Result};

pub mod actions;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod expression;
pub mod registry;
pub mod resolve;
pub mod run;
pub mod service;
pub mod validate;
pub mod variables;

pub use config::{EngineConfig, UndefinedVariablePolicy, load_config, load_config_from_path};
pub use dispatch::Dispatcher;
pub use error::{EngineError, EngineResult};
pub use registry::{ActionDescriptor, ActionHandler, ActionRegistry, ActionScope};
pub use run::{OutputStream, RunContext};
pub use runbook_types::{RunOptions, ScriptBody, Step, StepOutcome};
pub use service::{ScriptService, ServiceRegistry};
pub use validate::{ValidationIssue, validate_script};
pub use variables::VariableStore;

/// Loads a script file, picking the format from its extension.
///
/// `.json` files are parsed as JSON and `.yaml`/`.yml` files as YAML. Any
/// other file is treated as stored script text: a JSON document when it looks
/// like one, otherwise a legacy snippet.
pub fn parse_script_file(file_path: impl AsRef<Path>) -> Result<ScriptBody> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read script file: {}", file_path.display()))?;

    let extension = file_path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    let script = match extension.as_deref() {
        Some("json") => serde_json::from_str(&content).with_context(|| format!("Invalid JSON script: {}", file_path.display()))?,
        Some("yaml" | "yml") => serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML script: {}", file_path.display()))?,
        _ => ScriptBody::from_text(&content).with_context(|| format!("Invalid script: {}", file_path.display()))?,
    };
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_scripts_parse_into_steps() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let script_path = temp_dir.path().join("deploy.yaml");
        fs::write(
            &script_path,
            r#"
steps:
  - action: set_var
    name: region
    value: eu
  - action: print_msg
    message: "deploying to ${region}"
"#,
        )
        .expect("write");

        let ScriptBody::Steps { steps } = parse_script_file(&script_path).expect("parse") else {
            panic!("expected a step list");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].action(), Some("print_msg"));
    }

    #[test]
    fn plain_text_files_are_legacy_snippets() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let script_path = temp_dir.path().join("old.txt");
        fs::write(&script_path, "x = 1\nprint(x)\n").expect("write");
        assert!(parse_script_file(&script_path).expect("parse").is_legacy());
    }

    #[test]
    fn unreadable_files_report_their_path() {
        let error = parse_script_file("/definitely/not/here.json").expect_err("missing");
        assert!(error.to_string().contains("/definitely/not/here.json"));
    }
}
