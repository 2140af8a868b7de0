//! # HTTP Utilities
//!
//! Helpers for building request parts from loosely typed JSON options and for
//! turning responses back into JSON values.

use reqwest::header::HeaderMap;
use serde_json::{Map, Value};

/// Renders a JSON scalar as the text it stands for in a header, query string or form.
///
/// Strings are used verbatim, `null` becomes an empty string and any other
/// value is encoded as compact JSON.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Converts a JSON object into ordered key/value pairs.
///
/// Returns `None` when `value` is not an object.
pub fn object_pairs(value: &Value) -> Option<Vec<(String, String)>> {
    let map = value.as_object()?;
    Some(map.iter().map(|(key, value)| (key.clone(), scalar_text(value))).collect())
}

/// Builds a `Cookie` header value from a JSON object of cookie names to values.
///
/// ```rust
/// use runbook_util::http::cookie_header;
/// use serde_json::json;
///
/// let header = cookie_header(&json!({"session": "abc", "theme": "dark"}).as_object().unwrap());
/// assert_eq!(header, "session=abc; theme=dark");
/// ```
pub fn cookie_header(cookies: &Map<String, Value>) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={}", scalar_text(value)))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Encodes a JSON object as `application/x-www-form-urlencoded` text.
pub fn form_encode(fields: &Map<String, Value>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        serializer.append_pair(key, &scalar_text(value));
    }
    serializer.finish()
}

/// Returns true when a content type names JSON, including `+json` suffixes.
pub fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Collects response headers into a JSON object; repeated headers are joined with `, `.
pub fn header_map_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match map.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&text);
            }
            _ => {
                map.insert(name.as_str().to_string(), Value::String(text));
            }
        }
    }
    Value::Object(map)
}

/// Parses response text as JSON, returning `None` when it is not valid JSON.
pub fn parse_response_json(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text).ok()
}
