//! Action registry: maps action names to handlers and field metadata.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use runbook_types::{ActionMetadata, Step, StepOutcome};
use schemars::JsonSchema;
use serde_json::Value;

use crate::{
    dispatch::Dispatcher,
    error::{EngineError, EngineResult},
    run::RunContext,
};

/// What a handler may touch while it executes: the run it belongs to and the
/// dispatcher, for actions that run nested step lists.
pub struct ActionScope<'a> {
    pub run: &'a RunContext,
    pub dispatcher: &'a Dispatcher,
}

/// Behavior behind a registered action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Checks field values beyond presence. Runs on the resolved step before `execute`.
    fn validate(&self, _step: &Step) -> EngineResult<()> {
        Ok(())
    }

    /// Executes the step. `step` holds only `action` and the fields the action declares.
    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome>;
}

/// A registered action: its name, field lists, schema and handler.
#[derive(Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub required_fields: Vec<String>,
    pub optional_fields: Vec<String>,
    /// Fields handed to the handler without template resolution, such as child step lists.
    pub raw_fields: Vec<String>,
    pub schema: Value,
    pub handler: Arc<dyn ActionHandler>,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required_fields: Vec::new(),
            optional_fields: Vec::new(),
            raw_fields: Vec::new(),
            schema: Value::Null,
            handler: Arc::new(handler),
        }
    }

    pub fn required(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|field| field.to_string()).collect();
        self
    }

    pub fn optional(mut self, fields: &[&str]) -> Self {
        self.optional_fields = fields.iter().map(|field| field.to_string()).collect();
        self
    }

    pub fn raw(mut self, fields: &[&str]) -> Self {
        self.raw_fields = fields.iter().map(|field| field.to_string()).collect();
        self
    }

    /// Uses the JSON schema generated for `T` as the action's field schema.
    pub fn schema_from<T: JsonSchema>(mut self) -> Self {
        self.schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
        self
    }

    /// True when `field` is declared as required or optional.
    pub fn declares(&self, field: &str) -> bool {
        self.required_fields.iter().chain(&self.optional_fields).any(|declared| declared == field)
    }

    pub fn is_raw(&self, field: &str) -> bool {
        self.raw_fields.iter().any(|raw| raw == field)
    }

    /// First required field absent from `step`.
    pub fn missing_field(&self, step: &Step) -> Option<&str> {
        self.required_fields
            .iter()
            .find(|field| !step.contains(field))
            .map(String::as_str)
    }

    pub fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            name: self.name.clone(),
            description: self.description.clone(),
            required_fields: self.required_fields.clone(),
            optional_fields: self.optional_fields.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("required_fields", &self.required_fields)
            .field("optional_fields", &self.optional_fields)
            .finish_non_exhaustive()
    }
}

/// Registry of actions, filled once at startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: IndexMap<String, ActionDescriptor>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in action.
    pub fn with_builtins() -> EngineResult<Self> {
        let mut registry = Self::new();
        crate::actions::register_builtin_actions(&mut registry)?;
        Ok(registry)
    }

    /// Adds an action. Registering a name twice is an error.
    pub fn register(&mut self, descriptor: ActionDescriptor) -> EngineResult<()> {
        if self.actions.contains_key(&descriptor.name) {
            return Err(EngineError::DuplicateAction { name: descriptor.name });
        }
        self.actions.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> EngineResult<&ActionDescriptor> {
        self.actions.get(name).ok_or_else(|| EngineError::unknown_action(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Descriptors without handlers, in registration order.
    pub fn metadata(&self) -> Vec<ActionMetadata> {
        self.actions.values().map(ActionDescriptor::metadata).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
