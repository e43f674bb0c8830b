//! Secret masking for log output.
//!
//! Connect params and gateway frames can carry tokens, passwords, and
//! signatures. Anything logged goes through [`redact_value`], which replaces
//! secret-keyed values with a length-only placeholder. The wire value is
//! never mutated; redaction operates on a copy.

use serde_json::Value;

const SECRET_KEY_NAMES: &[&str] = &[
    "apikey",
    "api_key",
    "token",
    "secret",
    "password",
    "credentials",
    "signature",
];

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEY_NAMES.iter().any(|name| lower.contains(name))
}

fn placeholder(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(format!("[len {}]", s.len())),
        _ => Value::String("[redacted]".to_string()),
    }
}

fn redact_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_secret_key(key) {
                    *entry = placeholder(entry);
                } else {
                    redact_in_place(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_in_place(item);
            }
        }
        _ => {}
    }
}

/// Return a copy of `value` with secret-keyed entries masked.
pub fn redact_value(value: &Value) -> Value {
    let mut clone = value.clone();
    redact_in_place(&mut clone);
    clone
}
