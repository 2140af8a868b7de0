//! Filesystem path helpers for configuration lookup.

use std::{env, path::PathBuf};

use dirs_next::{config_dir, home_dir};

/// Directory name used under the platform configuration directory.
pub const APP_DIR_NAME: &str = "runbook";

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("~"));
    if trimmed == "~" {
        return home();
    }
    if let Some(rest) = trimmed.strip_prefix("~/").or_else(|| trimmed.strip_prefix("~\\")) {
        return home().join(rest);
    }
    PathBuf::from(trimmed)
}

/// Resolves a configuration file location.
///
/// A non-blank `override_var` environment variable wins (tilde expanded);
/// otherwise the file lives at `<config_dir>/runbook/<file_name>`.
pub fn config_file_path(override_var: &str, file_name: &str) -> PathBuf {
    if let Ok(path) = env::var(override_var)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR_NAME).join(file_name)
}
