//! Deterministic content fingerprint of a [`TaskRequest`].
//!
//! Two requests with the same type, script, input, timeout, metadata and
//! owner produce the same fingerprint regardless of when or where they were
//! built. Object keys inside `additional_properties` are sorted before
//! hashing, so insertion order does not matter.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::TaskRequest;

/// Hex-encoded SHA-256 of a request's canonical JSON form.
///
/// # Examples
///
/// ```
/// use taskrelay::{Fingerprint, TaskRequest};
///
/// let a = Fingerprint::of(&TaskRequest::new("GOLLM", "model_card")).unwrap();
/// let b = Fingerprint::of(&TaskRequest::new("GOLLM", "model_card")).unwrap();
/// let c = Fingerprint::of(&TaskRequest::new("GOLLM", "configure_model")).unwrap();
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// assert_eq!(a.as_str().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized to JSON.
    pub fn of(request: &TaskRequest) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(request)?;
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest.as_slice() {
            let _ = write!(hex, "{byte:02x}");
        }
        Ok(Self(hex))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Writes `value` as compact JSON with object keys in sorted order.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(key.as_str()) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn base() -> TaskRequest {
        TaskRequest::new("GOLLM", "model_card").with_input(&b"payload"[..])
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = base().with_additional_properties(json!({"a": 1, "b": {"x": 1, "y": 2}}));
        let b = base().with_additional_properties(json!({"b": {"y": 2, "x": 1}, "a": 1}));
        assert_eq!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn every_field_contributes() {
        let reference = Fingerprint::of(&base()).unwrap();
        let variants = [
            TaskRequest::new("MIRA", "model_card").with_input(&b"payload"[..]),
            TaskRequest::new("GOLLM", "other").with_input(&b"payload"[..]),
            base().with_input(&b"different"[..]),
            base().with_timeout(Duration::from_secs(5)),
            base().with_additional_properties(json!({"k": "v"})),
            base().with_owner("bob"),
        ];
        for variant in variants {
            assert_ne!(Fingerprint::of(&variant).unwrap(), reference, "{variant:?}");
        }
    }

    #[test]
    fn array_order_matters() {
        let a = base().with_additional_properties(json!([1, 2]));
        let b = base().with_additional_properties(json!([2, 1]));
        assert_ne!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn canonical_form_is_sorted_and_compact() {
        let mut out = String::new();
        write_canonical(&json!({"z": [true, null], "a": "s\"q"}), &mut out);
        assert_eq!(out, r#"{"a":"s\"q","z":[true,null]}"#);
    }
}
