//! # Shell-like Lexing Utilities
//!
//! Splits command strings into argument vectors without invoking a shell.
//! Single and double quotes group words, and a backslash escapes the next
//! character outside single quotes.

/// Splits input on unquoted whitespace, keeping quotes and escapes in each token.
fn raw_tokens(input: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut index = 0usize;

    while index < bytes.len() {
        while index < bytes.len() && bytes[index].is_ascii_whitespace() {
            index += 1;
        }
        if index >= bytes.len() {
            break;
        }
        let start = index;
        index = token_end(bytes, index);
        tokens.push(&input[start..index]);
    }

    tokens
}

fn token_end(bytes: &[u8], start: usize) -> usize {
    let mut index = start;
    let mut in_single_quotes = false;
    let mut in_double_quotes = false;

    while index < bytes.len() {
        let byte = bytes[index];
        if byte == b'\\' && !in_single_quotes && index + 1 < bytes.len() {
            index += 2;
            continue;
        }
        if byte == b'\'' && !in_double_quotes {
            in_single_quotes = !in_single_quotes;
        } else if byte == b'"' && !in_single_quotes {
            in_double_quotes = !in_double_quotes;
        } else if !in_single_quotes && !in_double_quotes && byte.is_ascii_whitespace() {
            break;
        }
        index += 1;
    }

    index
}

/// Splits a command line into program arguments with quotes removed.
///
/// Returns `None` when a quote is left open, so callers can reject the
/// command instead of running something other than what was written.
///
/// ```rust
/// use runbook_util::split_command_line;
///
/// let argv = split_command_line(r#"printf "%s\n" 'hello world'"#).unwrap();
/// assert_eq!(argv, vec!["printf", "%s\\n", "hello world"]);
/// ```
pub fn split_command_line(input: &str) -> Option<Vec<String>> {
    raw_tokens(input).into_iter().map(unquote).collect()
}

fn unquote(token: &str) -> Option<String> {
    let mut output = String::with_capacity(token.len());
    let mut chars = token.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(character) = chars.next() {
        match (quote, character) {
            (None, '\'' | '"') => quote = Some(character),
            (Some(open), c) if c == open => quote = None,
            (Some('\''), c) => output.push(c),
            (_, '\\') => match chars.next() {
                // Inside double quotes a backslash only escapes quote and backslash characters.
                Some(escaped) if quote.is_none() || matches!(escaped, '"' | '\\') => output.push(escaped),
                Some(other) => {
                    output.push('\\');
                    output.push(other);
                }
                None => output.push('\\'),
            },
            (_, c) => output.push(c),
        }
    }

    if quote.is_some() { None } else { Some(output) }
}
