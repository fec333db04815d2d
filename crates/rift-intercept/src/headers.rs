//! Reserved header names.
//!
//! Static `HeaderName`s avoid runtime `.parse().unwrap()` at call sites.

use hyper::header::HeaderName;
use hyper::HeaderMap;

/// Carries the correlation token from the client view to the listener view.
/// Never forwarded past the listener.
pub static X_RIFT_CORRELATION_ID: HeaderName = HeaderName::from_static("x-rift-correlation-id");

/// Set by the listener when a call could not be correlated.
pub static X_RIFT_CORRELATION_ERROR: HeaderName =
    HeaderName::from_static("x-rift-correlation-error");

/// Hop-by-hop headers that must not be replayed or forwarded verbatim.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Remove every reserved header so nothing outside this crate observes them.
pub fn strip_reserved(headers: &mut HeaderMap) {
    headers.remove(&X_RIFT_CORRELATION_ID);
    headers.remove(&X_RIFT_CORRELATION_ERROR);
}
