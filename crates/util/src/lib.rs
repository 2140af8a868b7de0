//! Stateless helpers shared by the Runbook engine and CLI.

pub mod http;
pub mod path_processing;
pub mod shell_lexing;

pub use path_processing::{config_file_path, expand_tilde};
pub use shell_lexing::split_command_line;

use once_cell::sync::Lazy;
use regex::Regex;

static REDACTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization: )((?:bearer |basic )?[\w\-\.=:/+]+)",
        r"(?i)(api[-_]?key: )([^\s,]+)",
        r"(?i)([A-Z0-9_]*?(KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
        r"(?i)(DATABASE_URL=)([^\s]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Redacts values that look like secrets in a string.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in REDACTION_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |caps: &regex::Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{prefix}<redacted>")
            })
            .to_string();
    }
    redacted
}

/// Caps diagnostic text at `limit` characters, marking the cut.
///
/// Diagnostics are redacted before they are capped.
pub fn cap_diagnostic(input: &str, limit: usize) -> String {
    let redacted = redact_sensitive(input);
    if redacted.chars().count() <= limit {
        return redacted;
    }
    let mut capped: String = redacted.chars().take(limit).collect();
    capped.push_str("… [truncated]");
    capped
}
