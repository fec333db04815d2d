use super::{Persistence, RequestMetadata};
use crate::error::PersistenceError;
use crate::fingerprint::Fingerprint;
use crate::request::SerializedResponse;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// In-memory implementation of Persistence
///
/// Responses are kept as serialized JSON so a damaged payload behaves the
/// same way it would coming back from disk. Useful for testing and for
/// embedders that only need a per-process cache.
#[derive(Default)]
pub struct MemoryPersistence {
    responses: RwLock<HashMap<Fingerprint, Vec<u8>>>,
    metadata: RwLock<HashMap<Fingerprint, RequestMetadata>>,
    auth_token: RwLock<Option<String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes under `fingerprint`, bypassing serialization.
    pub fn insert_raw(&self, fingerprint: Fingerprint, payload: impl Into<Vec<u8>>) {
        self.responses.write().insert(fingerprint, payload.into());
    }

    pub fn metadata(&self, fingerprint: &Fingerprint) -> Option<RequestMetadata> {
        self.metadata.read().get(fingerprint).cloned()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        let mut all: Vec<_> = self.responses.read().keys().cloned().collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.responses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.read().is_empty()
    }

    pub fn clear(&self) {
        self.responses.write().clear();
        self.metadata.write().clear();
    }
}

impl Persistence for MemoryPersistence {
    fn has_fingerprint(&self, fingerprint: &Fingerprint) -> Result<bool, PersistenceError> {
        Ok(self.responses.read().contains_key(fingerprint))
    }

    fn load_response(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<SerializedResponse>, PersistenceError> {
        let responses = self.responses.read();
        let Some(payload) = responses.get(fingerprint) else {
            return Ok(None);
        };
        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| PersistenceError::Corrupt {
                fingerprint: fingerprint.clone(),
                reason: e.to_string(),
            })
    }

    fn save_response(
        &self,
        fingerprint: &Fingerprint,
        response: &SerializedResponse,
    ) -> Result<(), PersistenceError> {
        let payload =
            serde_json::to_vec(response).map_err(|e| PersistenceError::Backend(e.to_string()))?;
        self.responses.write().insert(fingerprint.clone(), payload);
        debug!("Stored response for {}", fingerprint);
        Ok(())
    }

    fn save_request_metadata(
        &self,
        fingerprint: &Fingerprint,
        metadata: &RequestMetadata,
    ) -> Result<(), PersistenceError> {
        self.metadata
            .write()
            .insert(fingerprint.clone(), metadata.clone());
        Ok(())
    }

    fn load_auth_token(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.auth_token.read().clone())
    }

    fn save_auth_token(&self, token: &str) -> Result<(), PersistenceError> {
        *self.auth_token.write() = Some(token.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BodyEncoding;
    use std::collections::BTreeMap;

    fn response(status: u16, body: &str) -> SerializedResponse {
        SerializedResponse {
            status_code: status,
            headers: BTreeMap::new(),
            body: Some(body.to_string()),
            body_encoding: BodyEncoding::Utf8,
            body_json: None,
            latency_ms: Some(12),
        }
    }

    #[test]
    fn test_save_then_load() {
        let store = MemoryPersistence::new();
        let fp = Fingerprint::from_hex("deadbeef");
        assert!(!store.has_fingerprint(&fp).unwrap());
        assert!(store.load_response(&fp).unwrap().is_none());

        store.save_response(&fp, &response(200, "ok")).unwrap();
        assert!(store.has_fingerprint(&fp).unwrap());
        assert_eq!(store.load_response(&fp).unwrap(), Some(response(200, "ok")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_later_save_overwrites() {
        let store = MemoryPersistence::new();
        let fp = Fingerprint::from_hex("deadbeef");
        store.save_response(&fp, &response(200, "first")).unwrap();
        store.save_response(&fp, &response(201, "second")).unwrap();
        assert_eq!(store.load_response(&fp).unwrap().unwrap().status_code, 201);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_corrupt_payload_is_reported() {
        let store = MemoryPersistence::new();
        let fp = Fingerprint::from_hex("0badc0de");
        store.insert_raw(fp.clone(), b"{not json".to_vec());
        assert!(store.has_fingerprint(&fp).unwrap());
        match store.load_response(&fp) {
            Err(PersistenceError::Corrupt { fingerprint, .. }) => assert_eq!(fingerprint, fp),
            other => panic!("expected corrupt payload, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_token_round_trip() {
        let store = MemoryPersistence::new();
        assert_eq!(store.load_auth_token().unwrap(), None);
        store.save_auth_token("secret").unwrap();
        assert_eq!(store.load_auth_token().unwrap().as_deref(), Some("secret"));
    }

    #[test]
    fn test_clear() {
        let store = MemoryPersistence::new();
        store
            .save_response(&Fingerprint::from_hex("deadbeef"), &response(200, ""))
            .unwrap();
        store.clear();
        assert!(store.is_empty());
        assert!(store.fingerprints().is_empty());
    }
}
