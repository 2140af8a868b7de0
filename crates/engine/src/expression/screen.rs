//! Deny-list screening for untrusted expression text.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};

/// Patterns that reject an expression outright, paired with the label reported to the caller.
///
/// Double underscores, `import`, call forms of the code-execution builtins and
/// `os.`/`sys.` access match anywhere in the text; the remaining names match
/// as whole words.
static DENY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"__", "double underscore access"),
        (r"(?i)import", "import"),
        (r"\bfrom\b", "from"),
        (r"(exec|eval|compile)\s*\(", "code execution call"),
        (r"\b(exec|eval|compile)\b", "code execution builtin"),
        (r"(os|sys)\s*\.", "os/sys access"),
        (r"\b(open|file|input)\b", "file or input primitive"),
        (r"\b(globals|locals|dir|getattr|setattr|delattr|vars|breakpoint)\b", "reflection"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("deny pattern"), label))
    .collect()
});

/// Fails with an unsafe expression error when `expression` matches any deny pattern.
pub fn screen_expression(expression: &str) -> EngineResult<()> {
    match DENY_PATTERNS.iter().find(|(pattern, _)| pattern.is_match(expression)) {
        Some((_, label)) => Err(EngineError::unsafe_expression(*label)),
        None => Ok(()),
    }
}
