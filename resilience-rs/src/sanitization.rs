//! # Context Sanitization
//!
//! Redacts credentials from failure messages and open context maps before
//! they are retained in exception history or exported.

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // key=value style credentials
        Regex::new(r#"(?i)(api[_-]?key|token|secret|password|credential)s?["']?\s*[=:]\s*["']?([^"'\s,}]+)"#)
            .unwrap(),
        // bearer tokens
        Regex::new(r"(?i)bearer\s+[a-zA-Z0-9\._\-]+").unwrap(),
        // JWTs
        Regex::new(r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+").unwrap(),
        // provider-style secret keys
        Regex::new(r"\bsk-[a-zA-Z0-9]{16,}\b").unwrap(),
        // email addresses
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap(),
    ]
});

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "credential",
    "authorization",
    "api_key",
    "apikey",
    "private_key",
    "access_key",
    "cookie",
    "session_id",
];

/// True when a context key names a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|sensitive| key.contains(sensitive))
}

/// Masks credential-looking substrings in free text
pub fn sanitize_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        sanitized = pattern
            .replace_all(&sanitized, |caps: &regex::Captures| {
                if caps.len() > 2 {
                    format!("{}={}", &caps[1], REDACTED)
                } else {
                    REDACTED.to_string()
                }
            })
            .into_owned();
    }

    sanitized
}

/// Returns a copy of the map with sensitive keys and values redacted.
/// Nested objects and arrays are walked.
pub fn redact_context(
    context: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    context
        .iter()
        .map(|(key, value)| {
            let value = if is_sensitive_key(key) {
                serde_json::Value::String(REDACTED.to_string())
            } else {
                redact_value(value)
            };
            (key.clone(), value)
        })
        .collect()
}

fn redact_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(text) => serde_json::Value::String(sanitize_message(text)),
        serde_json::Value::Object(map) => serde_json::Value::Object(redact_context(map)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_value).collect())
        }
        other => other.clone(),
    }
}
