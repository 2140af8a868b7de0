//! Introspection view of registered actions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action descriptor without its handler, used to build script-authoring UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub name: String,
    pub description: String,
    pub required_fields: Vec<String>,
    pub optional_fields: Vec<String>,
    /// JSON schema describing the action's fields.
    pub schema: Value,
}
