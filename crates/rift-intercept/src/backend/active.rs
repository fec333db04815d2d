//! Process-wide active backend and the client entry point that routes to it.

use super::InterceptionBackend;
use crate::error::{BoxError, CallContext, InterceptError};
use crate::upstream::Upstream;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

static ACTIVE: Lazy<Mutex<Option<InterceptionBackend>>> = Lazy::new(|| Mutex::new(None));

/// The backend currently intercepting calls, if any.
pub fn active_backend() -> Option<InterceptionBackend> {
    ACTIVE.lock().clone()
}

/// Install `backend`, returning whichever backend it replaced.
pub(crate) fn install(backend: InterceptionBackend) -> Option<InterceptionBackend> {
    ACTIVE.lock().replace(backend)
}

/// Clear the slot only if it still holds `backend`.
pub(crate) fn clear_if(backend: &InterceptionBackend) {
    let mut slot = ACTIVE.lock();
    if slot.as_ref().is_some_and(|current| current.same_as(backend)) {
        *slot = None;
    }
}

/// Entry point for outbound calls made by code under test.
///
/// Calls go through the active backend when one is installed and straight to
/// `fallback` otherwise.
#[derive(Clone)]
pub struct InterceptedClient {
    fallback: Arc<dyn Upstream>,
}

impl InterceptedClient {
    pub fn new(fallback: Arc<dyn Upstream>) -> Self {
        Self { fallback }
    }

    pub async fn send<B>(&self, request: Request<B>) -> Result<Response<Bytes>, InterceptError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        if let Some(backend) = active_backend() {
            return backend.intercept(request).await.map(|intercepted| intercepted.response);
        }

        let (parts, body) = request.into_parts();
        let context = || {
            CallContext::new(
                parts.uri.host().unwrap_or_default(),
                parts.uri.path().to_string(),
            )
        };
        let body = body
            .collect()
            .await
            .map_err(|e| InterceptError::network(context(), e))?
            .to_bytes();
        let context = context();
        self.fallback
            .send(Request::from_parts(parts, body))
            .await
            .map_err(|e| InterceptError::network(context, e))
    }
}
