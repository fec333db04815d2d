//! Storage contract for recorded responses.
//!
//! The on-disk format is owned by the embedder; this crate only needs the
//! operations below. [`MemoryPersistence`] is the in-process implementation.

mod memory;

pub use memory::MemoryPersistence;

use crate::error::PersistenceError;
use crate::fingerprint::Fingerprint;
use crate::request::{SerializedRequest, SerializedResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What was asked for, stored next to the response it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub request: SerializedRequest,
    pub story: Vec<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Redaction rules in effect, as JSON.
    #[serde(default)]
    pub redact: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Response cache keyed by fingerprint.
///
/// Implementations must be safe to call from concurrent tasks.
pub trait Persistence: Send + Sync {
    fn has_fingerprint(&self, fingerprint: &Fingerprint) -> Result<bool, PersistenceError>;

    /// `Ok(None)` when nothing is stored; `PersistenceError::Corrupt` when a
    /// stored payload cannot be read back.
    fn load_response(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<SerializedResponse>, PersistenceError>;

    fn save_response(
        &self,
        fingerprint: &Fingerprint,
        response: &SerializedResponse,
    ) -> Result<(), PersistenceError>;

    fn save_request_metadata(
        &self,
        fingerprint: &Fingerprint,
        metadata: &RequestMetadata,
    ) -> Result<(), PersistenceError>;

    /// Token presented to the relay endpoint, if one has been stored.
    fn load_auth_token(&self) -> Result<Option<String>, PersistenceError>;

    fn save_auth_token(&self, token: &str) -> Result<(), PersistenceError>;
}
