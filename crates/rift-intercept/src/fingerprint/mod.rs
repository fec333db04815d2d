//! Request fingerprinting.
//!
//! A fingerprint is the first 8 hex characters of the SHA-256 of a canonical
//! JSON object built from the request, the session story and optional
//! user/signature, after redaction. Key order anywhere in the object never
//! affects the result.
//!
//! # Module Structure
//!
//! - `redaction` - Redaction rule types and application
//! - `story` - Per-session fingerprint sequence

mod redaction;
mod story;

pub use redaction::{FieldRule, RedactionRule, RedactionRules};
pub use story::Story;

use crate::request::SerializedRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 8;

/// Short deterministic digest identifying a request for cache lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing digest string (e.g. one read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-level inputs to a fingerprint.
#[derive(Debug, Clone, Default)]
pub struct FingerprintContext<'a> {
    pub story: &'a [Fingerprint],
    pub user_id: Option<&'a str>,
    pub signature: Option<&'a str>,
}

/// Build the object that is redacted and hashed.
pub fn hashable_object(request: &SerializedRequest, context: &FingerprintContext<'_>) -> Map<String, Value> {
    let body = match (&request.body_json, &request.body) {
        (Some(parsed), _) => parsed.clone(),
        (None, Some(text)) => Value::String(text.clone()),
        (None, None) => Value::Null,
    };
    let headers: Map<String, Value> = request
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();

    let mut object = Map::new();
    object.insert("body".to_string(), body);
    object.insert("headers".to_string(), Value::Object(headers));
    object.insert("host".to_string(), Value::String(request.hostname.clone()));
    object.insert(
        "method".to_string(),
        Value::String(request.method.as_str().to_string()),
    );
    object.insert("path".to_string(), Value::String(request.path.clone()));
    object.insert(
        "story".to_string(),
        Value::Array(
            context
                .story
                .iter()
                .map(|fp| Value::String(fp.0.clone()))
                .collect(),
        ),
    );
    if let Some(user_id) = context.user_id {
        object.insert("user_id".to_string(), Value::String(user_id.to_string()));
    }
    if let Some(signature) = context.signature {
        object.insert("signature".to_string(), Value::String(signature.to_string()));
    }
    object
}

/// Compute the fingerprint of `request`. Pure; no I/O.
pub fn fingerprint(
    request: &SerializedRequest,
    context: &FingerprintContext<'_>,
    rules: &RedactionRules,
) -> Fingerprint {
    let mut object = hashable_object(request, context);
    rules.apply(&mut object);
    digest(&Value::Object(object))
}

/// Hash a JSON value after canonicalizing key order.
pub fn digest(value: &Value) -> Fingerprint {
    // Serializing a Value never fails: all keys are strings.
    let canonical = serde_json::to_string(&canonicalize(value)).unwrap_or_default();
    let hash = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(hash);
    hex.truncate(FINGERPRINT_LEN);
    Fingerprint(hex)
}

/// Rebuild `value` with object keys inserted in sorted order at every depth.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
