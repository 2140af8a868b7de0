//! # Template Resolution
//!
//! Rewrites `${name}` placeholders inside step fields using the run's
//! variables. Strings are scanned for placeholders, arrays and objects are
//! rebuilt recursively, and every other value passes through unchanged. The
//! input is never mutated.
//!
//! ```rust
//! use runbook_engine::config::UndefinedVariablePolicy;
//! use runbook_engine::resolve::resolve_value;
//! use runbook_engine::variables::VariableStore;
//! use serde_json::json;
//!
//! let mut variables = VariableStore::new();
//! variables.set("region", json!("us"));
//!
//! let value = json!({"url": "https://${region}.example.com", "tags": ["${region}", "${zone}"]});
//! let resolved = resolve_value(&value, &variables, UndefinedVariablePolicy::Preserve).unwrap();
//! assert_eq!(resolved["url"], "https://us.example.com");
//! assert_eq!(resolved["tags"][1], "${zone}");
//! ```

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::{
    config::UndefinedVariablePolicy,
    error::{EngineError, EngineResult},
    variables::VariableStore,
};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Recursively resolves every placeholder in a JSON value.
pub fn resolve_value(value: &Value, variables: &VariableStore, policy: UndefinedVariablePolicy) -> EngineResult<Value> {
    match value {
        Value::String(text) => resolve_string(text, variables, policy).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, variables, policy))
            .collect::<EngineResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_value(value, variables, policy)?);
            }
            Ok(Value::Object(resolved))
        }
        _ => Ok(value.clone()),
    }
}

/// Substitutes placeholders in a single string.
///
/// Substitution is a single pass: text inserted for one placeholder is not
/// scanned again.
pub fn resolve_string(text: &str, variables: &VariableStore, policy: UndefinedVariablePolicy) -> EngineResult<String> {
    if !text.contains("${") {
        return Ok(text.to_string());
    }

    let mut undefined: Option<String> = None;
    let resolved = PLACEHOLDER.replace_all(text, |captures: &Captures| {
        let name = &captures[1];
        match variables.get(name) {
            Some(value) => display_value(value),
            None => {
                undefined.get_or_insert_with(|| name.to_string());
                captures[0].to_string()
            }
        }
    });

    match (undefined, policy) {
        (Some(name), UndefinedVariablePolicy::Error) => Err(EngineError::undefined_variable(name)),
        _ => Ok(resolved.into_owned()),
    }
}

/// Text substituted for a variable value.
///
/// Strings are inserted verbatim; everything else uses its compact JSON form.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
