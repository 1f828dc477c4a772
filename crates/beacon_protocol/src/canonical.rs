//! Canonical JSON v1 — the deterministic serialization signatures cover.
//!
//! Rules: UTF-8, no whitespace, object keys sorted by Unicode codepoint,
//! arrays in original order, numbers in their shortest unambiguous form,
//! strings with minimal JSON escapes. The signed payload is the top-level
//! object with `id`, `signature`, and `public_key` removed; nested fields
//! of the same name (e.g. `wallet_auth.signature`) are preserved.

use serde_json::Value;
use thiserror::Error;

/// Top-level keys excluded from the signed payload.
const UNSIGNED_KEYS: [&str; 3] = ["id", "signature", "public_key"];

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("signed payload must be a JSON object")]
    NotAnObject,
}

/// Canonical bytes a job spec signature is verified against.
pub fn signed_payload(spec: &Value) -> Result<Vec<u8>, CanonicalError> {
    let Value::Object(fields) = spec else {
        return Err(CanonicalError::NotAnObject);
    };
    let mut fields = fields.clone();
    for key in UNSIGNED_KEYS {
        fields.remove(key);
    }
    Ok(canonical_json(&Value::Object(fields)).into_bytes())
}

/// Serialize any JSON value into canonical form.
///
/// Key order is enforced here rather than relying on the parser's map
/// representation, so the output is stable no matter how the value was
/// built.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders numbers via itoa/ryu, which is the shortest
        // round-trippable form.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(out, s),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            // UTF-8 byte order equals Unicode codepoint order.
            keys.sort_unstable();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_canonical(out, &fields[key]);
            }
            out.push('}');
        }
    }
}

fn write_escaped(out: &mut String, s: &str) {
    // serde_json emits minimal escapes: the two mandatory characters plus
    // control characters, everything else verbatim.
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => unreachable!("string serialization is infallible"),
    }
}
