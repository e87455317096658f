//! Recursive redaction of sensitive keys in structured payloads.
//!
//! Every audit payload passes through [`redact_payload`] before it is
//! persisted or logged. Matching is substring-based on lowercased key names
//! and recursion is depth-capped so a pathological payload cannot stall the
//! audit path.

use serde_json::Value;

/// Key-name substrings that mark a value as sensitive.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "auth",
    "credential",
    "private_key",
];

const MAX_DEPTH: usize = 10;

/// Replace every value under a sensitive key with `"<REDACTED>"`.
#[must_use]
pub fn redact_payload(value: &Value) -> Value {
    redact_at_depth(value, 0)
}

fn redact_at_depth(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return value.clone();
    }
    match value {
        Value::Object(map) => {
            let redacted = map
                .iter()
                .map(|(k, v)| {
                    if is_sensitive_key(k) {
                        (k.clone(), Value::String("<REDACTED>".to_string()))
                    } else {
                        (k.clone(), redact_at_depth(v, depth + 1))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| redact_at_depth(v, depth + 1)).collect())
        }
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|s| lowered.contains(s))
}
