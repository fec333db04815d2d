//! Correlates an outgoing call with its arrival at the interception listener.
//!
//! The client side tags the request with a fresh token in the reserved
//! `x-rift-correlation-id` header and keeps a [`CorrelationGuard`]. The
//! listener side extracts the token, strips the header and receives the
//! [`CallHandle`] the client registered. Each token is consumed at most once;
//! dropping the guard releases an entry nobody extracted.

use crate::error::{CallContext, InterceptError};
use crate::fingerprint::{Fingerprint, RedactionRules};
use crate::headers::{strip_reserved, X_RIFT_CORRELATION_ID};
use crate::metrics::OUTSTANDING_CORRELATIONS;
use crate::request::SerializedRequest;
use hyper::header::HeaderValue;
use hyper::Request;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Everything the listener needs to finish a call the client started.
///
/// The listener reports a failure back to the client through [`fail`]; the
/// client picks it up with [`take_failure`] once the response arrives.
///
/// [`fail`]: CallHandle::fail
/// [`take_failure`]: CallHandle::take_failure
#[derive(Debug)]
pub struct CallHandle {
    pub fingerprint: Fingerprint,
    pub request: SerializedRequest,
    /// Story as it was when the call was fingerprinted, most recent first.
    pub story: Vec<Fingerprint>,
    pub rules: Arc<RedactionRules>,
    pub signature: Option<String>,
    failure: Mutex<Option<InterceptError>>,
}

impl CallHandle {
    pub fn new(
        fingerprint: Fingerprint,
        request: SerializedRequest,
        story: Vec<Fingerprint>,
        rules: Arc<RedactionRules>,
        signature: Option<String>,
    ) -> Self {
        Self {
            fingerprint,
            request,
            story,
            rules,
            signature,
            failure: Mutex::new(None),
        }
    }

    pub fn context(&self) -> CallContext {
        self.request.context().with_fingerprint(self.fingerprint.clone())
    }

    /// Record the first failure seen while serving this call.
    pub fn fail(&self, error: InterceptError) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn take_failure(&self) -> Option<InterceptError> {
        self.failure.lock().take()
    }
}

#[derive(Default)]
struct Registry {
    active: AtomicBool,
    entries: Mutex<HashMap<String, Arc<CallHandle>>>,
}

impl Registry {
    fn remove(&self, token: &str) -> Option<Arc<CallHandle>> {
        let removed = self.entries.lock().remove(token);
        if removed.is_some() {
            OUTSTANDING_CORRELATIONS.dec();
        }
        removed
    }
}

/// Token to handle registry owned by one backend.
#[derive(Clone, Default)]
pub struct RequestCorrelator {
    registry: Arc<Registry>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin accepting tags. Idempotent.
    pub fn start(&self) {
        if !self.registry.active.swap(true, Ordering::SeqCst) {
            debug!("Request correlator started");
        }
    }

    /// Stop accepting tags and release every outstanding entry. Idempotent.
    pub fn stop(&self) {
        self.registry.active.store(false, Ordering::SeqCst);
        let released: Vec<_> = self.registry.entries.lock().drain().collect();
        if !released.is_empty() {
            OUTSTANDING_CORRELATIONS.sub(released.len() as i64);
            debug!("Released {} outstanding correlations", released.len());
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry.active.load(Ordering::SeqCst)
    }

    /// Register `handle` under a fresh token and write the token into the
    /// request. Returns `None` when the correlator is not active.
    pub fn tag<B>(&self, request: &mut Request<B>, handle: Arc<CallHandle>) -> Option<CorrelationGuard> {
        if !self.is_active() {
            return None;
        }
        let token = uuid::Uuid::new_v4().to_string();
        let value = HeaderValue::from_str(&token).ok()?;

        self.registry.entries.lock().insert(token.clone(), handle);
        OUTSTANDING_CORRELATIONS.inc();
        request
            .headers_mut()
            .insert(X_RIFT_CORRELATION_ID.clone(), value);

        Some(CorrelationGuard {
            token,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Consume the token on an arriving request.
    ///
    /// Reserved headers are stripped whether or not the lookup succeeds.
    pub fn extract<B>(&self, request: &mut Request<B>) -> Result<Arc<CallHandle>, InterceptError> {
        let token = request
            .headers()
            .get(&X_RIFT_CORRELATION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        strip_reserved(request.headers_mut());

        let context = || request_context(request);
        let Some(token) = token else {
            error!("Request reached the listener without a correlation token");
            return Err(InterceptError::Correlation {
                context: context(),
                reason: "missing correlation token".to_string(),
            });
        };

        self.registry.remove(&token).ok_or_else(|| {
            error!("Correlation token {} is not mapped to a call", token);
            InterceptError::Correlation {
                context: context(),
                reason: format!("unknown or already consumed token '{token}'"),
            }
        })
    }

    /// Number of tokens issued but not yet consumed or released.
    pub fn outstanding(&self) -> usize {
        self.registry.entries.lock().len()
    }
}

fn request_context<B>(request: &Request<B>) -> CallContext {
    let host = request
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    CallContext::new(host, path)
}

/// Releases the correlation entry on drop if it was never extracted.
#[must_use = "dropping the guard releases the correlation entry"]
pub struct CorrelationGuard {
    token: String,
    registry: Arc<Registry>,
}

impl CorrelationGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for CorrelationGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.token).is_some() {
            debug!("Released unconsumed correlation {}", self.token);
        }
    }
}
