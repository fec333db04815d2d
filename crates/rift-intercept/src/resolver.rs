//! Response sourcing for cache misses.
//!
//! The listener hands every correlated call to a [`ResponseResolver`]:
//! [`DirectResolver`] forwards it to the original destination, while
//! [`RelayResolver`] re-encodes it as a call to a remote fake-data endpoint.

use crate::correlator::CallHandle;
use crate::error::InterceptError;
use crate::headers::{is_hop_by_hop, strip_reserved};
use crate::persistence::Persistence;
use crate::upstream::Upstream;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, HOST};
use hyper::{Request, Response, Uri};
use std::sync::Arc;
use tracing::{debug, error};

/// Produces the live response for a call the listener has correlated.
#[async_trait]
pub trait ResponseResolver: Send + Sync {
    async fn resolve(
        &self,
        handle: &CallHandle,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, InterceptError>;
}

/// Drop hop-by-hop and reserved headers before a request leaves the process.
fn sanitize_headers(request: &mut Request<Bytes>) {
    strip_reserved(request.headers_mut());
    let hop: Vec<_> = request
        .headers()
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        request.headers_mut().remove(name);
    }
}

fn with_uri(handle: &CallHandle, request: Request<Bytes>, uri: &str) -> Result<Request<Bytes>, InterceptError> {
    let uri: Uri = uri
        .parse()
        .map_err(|e| InterceptError::protocol(handle.context(), format!("invalid target URI: {e}")))?;
    let (mut parts, body) = request.into_parts();
    parts.uri = uri;
    Ok(Request::from_parts(parts, body))
}

/// Forwards to the destination the caller dialled.
pub struct DirectResolver {
    upstream: Arc<dyn Upstream>,
}

impl DirectResolver {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl ResponseResolver for DirectResolver {
    async fn resolve(
        &self,
        handle: &CallHandle,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, InterceptError> {
        let target = format!("{}{}", handle.request.origin(), handle.request.path);
        let mut request = with_uri(handle, request, &target)?;
        sanitize_headers(&mut request);

        debug!("Forwarding {} directly", target);
        self.upstream.send(request).await.map_err(|e| {
            error!("Live call to {} failed: {}", target, e);
            InterceptError::network(handle.context(), e)
        })
    }
}

/// Re-encodes calls for a remote fake-data endpoint.
pub struct RelayResolver {
    endpoint: String,
    upstream: Arc<dyn Upstream>,
    persistence: Arc<dyn Persistence>,
}

impl RelayResolver {
    pub fn new(
        endpoint: impl Into<String>,
        upstream: Arc<dyn Upstream>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            upstream,
            persistence,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Percent-encode everything except unreserved characters and `/`.
fn encode_path(path: &str) -> String {
    urlencoding::encode(path).replace("%2F", "/")
}

/// Build the relay URL for `handle`:
/// `{endpoint}/x/?story=..&path=..&hostname=..&method=..&headers=..[&ignore=..][&signature=..]`.
pub fn relay_uri(endpoint: &str, handle: &CallHandle) -> Result<String, InterceptError> {
    let to_json = |value: serde_json::Result<String>| {
        value.map_err(|e| InterceptError::protocol(handle.context(), format!("relay encoding failed: {e}")))
    };
    let story = to_json(serde_json::to_string(&handle.story))?;
    let headers = to_json(serde_json::to_string(&handle.request.headers))?;

    let mut uri = format!(
        "{}/x/?story={}&path={}&hostname={}&method={}&headers={}",
        endpoint.trim_end_matches('/'),
        urlencoding::encode(&story),
        encode_path(&handle.request.path),
        urlencoding::encode(&handle.request.hostname),
        handle.request.method.as_str(),
        urlencoding::encode(&headers),
    );
    if !handle.rules.is_empty() {
        let ignore = handle.rules.to_json().to_string();
        uri.push_str("&ignore=");
        uri.push_str(&urlencoding::encode(&ignore));
    }
    if let Some(signature) = &handle.signature {
        uri.push_str("&signature=");
        uri.push_str(&urlencoding::encode(signature));
    }
    Ok(uri)
}

#[async_trait]
impl ResponseResolver for RelayResolver {
    async fn resolve(
        &self,
        handle: &CallHandle,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, InterceptError> {
        let target = relay_uri(&self.endpoint, handle)?;
        let mut request = with_uri(handle, request, &target)?;
        sanitize_headers(&mut request);
        request.headers_mut().remove(HOST);

        let token = self
            .persistence
            .load_auth_token()
            .map_err(|source| InterceptError::Persistence {
                context: handle.context(),
                source,
            })?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                InterceptError::Configuration(format!("auth token is not a valid header value: {e}"))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!("Relaying {} via {}", handle.request.path, self.endpoint);
        self.upstream.send(request).await.map_err(|e| {
            error!("Relay call for {} failed: {}", handle.context(), e);
            InterceptError::network(handle.context(), e)
        })
    }
}
