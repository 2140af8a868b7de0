//! Shared type definitions for the Runbook engine and its front ends.
//!
//! Everything here is plain data: scripts and steps as they arrive from the
//! storage layer, run status snapshots, step outcomes, history entries and
//! action metadata. Behavior lives in `runbook-engine`.

pub mod action;
pub mod run;
pub mod script;

pub use action::ActionMetadata;
pub use run::{ErrorKind, HistoryEntry, OutcomeResult, RunStatus, RunSummary, StatusSnapshot, StepOutcome, TriggerRecord, TriggerType};
pub use script::{RunOptions, ScriptBody, Step};
