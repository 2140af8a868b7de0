//! Engine configuration and its on-disk loader.

use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use runbook_util::config_file_path;
use serde::{Deserialize, Serialize};

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "RUNBOOK_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "engine.json";

/// What the template resolver does with `${name}` when `name` is not defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedVariablePolicy {
    /// Leave the placeholder in the text untouched.
    #[default]
    Preserve,
    /// Fail the step with an undefined variable error.
    Error,
}

/// Limits and policies shared by every run of an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Loop bound used when a `loop` step does not set `max_iterations`.
    pub max_loop_iterations: usize,
    pub command_timeout_secs: f64,
    pub http_timeout_secs: f64,
    /// Output lines retained per run; the oldest line is dropped past this.
    pub output_capacity: usize,
    /// Lines buffered per live output subscriber before it starts lagging.
    pub stream_capacity: usize,
    pub undefined_variables: UndefinedVariablePolicy,
    /// Maximum characters of diagnostic detail attached to error outcomes.
    pub diagnostic_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 1000,
            command_timeout_secs: 60.0,
            http_timeout_secs: 10.0,
            output_capacity: 1000,
            stream_capacity: 256,
            undefined_variables: UndefinedVariablePolicy::Preserve,
            diagnostic_limit: 2000,
        }
    }
}

impl EngineConfig {
    pub fn http_timeout(&self) -> Duration {
        secs_to_duration(self.http_timeout_secs)
    }

    /// Rejects settings that would make the engine unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_loop_iterations == 0 {
            anyhow::bail!("max_loop_iterations must be at least 1");
        }
        if self.output_capacity == 0 || self.stream_capacity == 0 {
            anyhow::bail!("output_capacity and stream_capacity must be at least 1");
        }
        for (name, value) in [
            ("command_timeout_secs", self.command_timeout_secs),
            ("http_timeout_secs", self.http_timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                anyhow::bail!("{name} must be a positive number of seconds");
            }
        }
        Ok(())
    }
}

/// Converts user supplied seconds to a duration, clamping negatives and NaN to zero.
pub(crate) fn secs_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Returns the default path for the engine configuration file.
pub fn default_config_path() -> std::path::PathBuf {
    config_file_path(CONFIG_PATH_ENV, CONFIG_FILE_NAME)
}

/// Loads configuration from the default path.
pub fn load_config() -> anyhow::Result<EngineConfig> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from a specific path; a missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: EngineConfig =
        serde_json::from_str(&content).with_context(|| format!("parsing engine config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
