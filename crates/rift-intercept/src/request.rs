//! Serialized request/response descriptions.
//!
//! These are the immutable views of an exchange that feed fingerprinting,
//! persistence and the relay encoding. The live bytes stay in the
//! `hyper::Request`/`Response`; these types describe them.

use crate::error::{CallContext, InterceptError};
use base64::Engine;
use bytes::Bytes;
use hyper::http::{request, response};
use hyper::{HeaderMap, Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The eight REST verbs an intercepted call may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Trace,
}

impl HttpMethod {
    pub fn from_method(method: &Method) -> Option<Self> {
        match method.as_str() {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }

    /// Lower-case name, as used in fingerprints and the relay encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Head => "head",
            Self::Post => "post",
            Self::Put => "put",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Options => "options",
            Self::Trace => "trace",
        }
    }
}

/// URI scheme of an intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

/// A header or query value that may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn push(&mut self, value: String) {
        match self {
            OneOrMany::One(existing) => {
                let first = std::mem::take(existing);
                *self = OneOrMany::Many(vec![first, value]);
            }
            OneOrMany::Many(values) => values.push(value),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(v) => vec![v.as_str()],
            OneOrMany::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OneOrMany::One(v) => Value::String(v.clone()),
            OneOrMany::Many(vs) => Value::Array(vs.iter().cloned().map(Value::String).collect()),
        }
    }
}

pub type FieldValues = BTreeMap<String, OneOrMany>;

fn insert_field(map: &mut FieldValues, key: String, value: String) {
    match map.get_mut(&key) {
        Some(existing) => existing.push(value),
        None => {
            map.insert(key, OneOrMany::One(value));
        }
    }
}

/// Collect headers into lower-cased keys. Values that are not visible ASCII are skipped.
pub fn serialize_headers(headers: &HeaderMap) -> FieldValues {
    let mut out = FieldValues::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            insert_field(&mut out, name.as_str().to_ascii_lowercase(), v.to_string());
        }
    }
    out
}

/// Parse a query string into a multi-valued map, percent-decoding values.
pub fn parse_query(query: Option<&str>) -> FieldValues {
    let mut params = FieldValues::new();
    if let Some(q) = query {
        for pair in q.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                insert_field(
                    &mut params,
                    urlencoding::decode(key).unwrap_or_default().to_string(),
                    urlencoding::decode(value).unwrap_or_default().to_string(),
                );
            } else if !pair.is_empty() {
                insert_field(&mut params, pair.to_string(), String::new());
            }
        }
    }
    params
}

/// How a stored body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Utf8,
    Base64,
}

fn encode_body(bytes: &[u8]) -> (Option<String>, BodyEncoding, Option<Value>) {
    if bytes.is_empty() {
        return (None, BodyEncoding::Utf8, None);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let parsed = serde_json::from_str::<Value>(text).ok();
            (Some(text.to_string()), BodyEncoding::Utf8, parsed)
        }
        Err(_) => (
            Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            BodyEncoding::Base64,
            None,
        ),
    }
}

/// Immutable description of an outgoing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRequest {
    pub protocol: Protocol,
    /// Authority as dialled, including a non-default port.
    pub host: String,
    pub hostname: String,
    pub pathname: String,
    /// Path including the query string.
    pub path: String,
    pub query: FieldValues,
    pub headers: FieldValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_json: Option<Value>,
    pub method: HttpMethod,
}

/// Where a call is headed, resolved without judging its method or scheme.
///
/// This is all the whitelist needs, so calls this crate cannot fingerprint can
/// still pass through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// URI scheme as given; `None` for origin-form requests.
    pub scheme: Option<String>,
    /// Authority as dialled, including a non-default port.
    pub host: String,
    pub hostname: String,
    /// Path including the query string.
    pub path: String,
}

impl Destination {
    /// The URI must be absolute, or a `Host` header must name the destination.
    pub fn from_parts(parts: &request::Parts) -> Result<Self, InterceptError> {
        let uri = &parts.uri;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let (hostname, port) = match uri.authority() {
            Some(authority) => (authority.host().to_string(), authority.port_u16()),
            None => match parts.headers.get(hyper::header::HOST).and_then(|h| h.to_str().ok()) {
                Some(host_header) => split_host_header(host_header),
                None => {
                    return Err(InterceptError::protocol(
                        CallContext::new("", path),
                        "request has neither an absolute URI nor a Host header",
                    ))
                }
            },
        };
        if hostname.is_empty() {
            return Err(InterceptError::protocol(CallContext::new("", path), "empty host"));
        }

        let scheme = uri.scheme_str().map(str::to_ascii_lowercase);
        let default_port = match scheme.as_deref() {
            Some("https") => Some(Protocol::Https.default_port()),
            Some("http") | None => Some(Protocol::Http.default_port()),
            Some(_) => None,
        };
        let host = match port {
            Some(p) if Some(p) != default_port => format!("{hostname}:{p}"),
            _ => hostname.clone(),
        };

        Ok(Self {
            scheme,
            host,
            hostname,
            path,
        })
    }

    /// Absolute URL of the destination. Origin-form requests are dialled in the clear.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.as_deref().unwrap_or("http"), self.host, self.path)
    }

    pub fn context(&self) -> CallContext {
        CallContext::new(self.hostname.clone(), self.path.clone())
    }
}

impl SerializedRequest {
    /// Describe a request whose body has already been fully buffered.
    ///
    /// Only the eight REST verbs over `http` or `https` can be described.
    pub fn from_parts(parts: &request::Parts, body: &[u8]) -> Result<Self, InterceptError> {
        Self::from_destination(Destination::from_parts(parts)?, parts, body)
    }

    pub fn from_destination(
        destination: Destination,
        parts: &request::Parts,
        body: &[u8],
    ) -> Result<Self, InterceptError> {
        let protocol = match destination.scheme.as_deref() {
            Some("http") | None => Protocol::Http,
            Some("https") => Protocol::Https,
            Some(other) => {
                return Err(InterceptError::protocol(
                    destination.context(),
                    format!("unsupported protocol '{other}'"),
                ))
            }
        };

        let method = HttpMethod::from_method(&parts.method).ok_or_else(|| {
            InterceptError::protocol(
                destination.context(),
                format!("unsupported method '{}'", parts.method),
            )
        })?;

        let (body, body_encoding, body_json) = encode_body(body);
        let Destination {
            host,
            hostname,
            path,
            ..
        } = destination;

        Ok(Self {
            protocol,
            host,
            hostname,
            pathname: parts.uri.path().to_string(),
            path,
            query: parse_query(parts.uri.query()),
            headers: serialize_headers(&parts.headers),
            body,
            body_encoding,
            body_json,
            method,
        })
    }

    /// `scheme://host` of the original destination.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.protocol.as_str(), self.host)
    }

    pub fn context(&self) -> CallContext {
        CallContext::new(self.hostname.clone(), self.path.clone())
    }
}

fn split_host_header(value: &str) -> (String, Option<u16>) {
    // Bracketed IPv6 literals keep their brackets, like `Authority::host`.
    if let Some(end) = value.find(']') {
        let host = value[..=end].to_string();
        let port = value[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
        return (host, port);
    }
    match value.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(p) => (host.to_string(), Some(p)),
            Err(_) => (value.to_string(), None),
        },
        None => (value.to_string(), None),
    }
}

/// Description of a completed response, as persisted and replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedResponse {
    pub status_code: u16,
    pub headers: FieldValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_json: Option<Value>,
    /// Observed upstream latency, replayed through the emulated socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl SerializedResponse {
    pub fn from_parts(parts: &response::Parts, body: &[u8], latency_ms: Option<u64>) -> Self {
        let (body, body_encoding, body_json) = encode_body(body);
        Self {
            status_code: parts.status.as_u16(),
            headers: serialize_headers(&parts.headers),
            body,
            body_encoding,
            body_json,
            latency_ms,
        }
    }

    pub fn from_response(response: &Response<Bytes>, latency_ms: Option<u64>) -> Self {
        let (body, body_encoding, body_json) = encode_body(response.body());
        Self {
            status_code: response.status().as_u16(),
            headers: serialize_headers(response.headers()),
            body,
            body_encoding,
            body_json,
            latency_ms,
        }
    }

    /// Decode the stored body back into raw bytes.
    pub fn body_bytes(&self) -> Result<Bytes, base64::DecodeError> {
        match (&self.body, self.body_encoding) {
            (None, _) => Ok(Bytes::new()),
            (Some(text), BodyEncoding::Utf8) => Ok(Bytes::from(text.clone())),
            (Some(encoded), BodyEncoding::Base64) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map(Bytes::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn parts(req: Request<()>) -> request::Parts {
        req.into_parts().0
    }

    #[test]
    fn test_serialize_absolute_https_request() {
        let req = Request::builder()
            .method("POST")
            .uri("https://api.example.com/v1/users?limit=10&tag=a&tag=b")
            .header("Content-Type", "application/json")
            .body(())
            .unwrap();
        let body = br#"{"name":"ada"}"#;
        let serialized = SerializedRequest::from_parts(&parts(req), body).unwrap();

        assert_eq!(serialized.protocol, Protocol::Https);
        assert_eq!(serialized.host, "api.example.com");
        assert_eq!(serialized.hostname, "api.example.com");
        assert_eq!(serialized.pathname, "/v1/users");
        assert_eq!(serialized.path, "/v1/users?limit=10&tag=a&tag=b");
        assert_eq!(serialized.method, HttpMethod::Post);
        assert_eq!(
            serialized.query.get("tag"),
            Some(&OneOrMany::Many(vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(
            serialized.headers.get("content-type"),
            Some(&OneOrMany::One("application/json".to_string()))
        );
        assert_eq!(serialized.body_json.unwrap()["name"], "ada");
    }

    #[test]
    fn test_non_default_port_kept_in_host() {
        let req = Request::builder()
            .uri("http://localhost:8080/health")
            .body(())
            .unwrap();
        let serialized = SerializedRequest::from_parts(&parts(req), b"").unwrap();
        assert_eq!(serialized.host, "localhost:8080");
        assert_eq!(serialized.hostname, "localhost");
        assert_eq!(serialized.origin(), "http://localhost:8080");
        assert!(serialized.body.is_none());
    }

    #[test]
    fn test_host_header_fallback() {
        let req = Request::builder()
            .uri("/status")
            .header("host", "internal.svc:9000")
            .body(())
            .unwrap();
        let serialized = SerializedRequest::from_parts(&parts(req), b"").unwrap();
        assert_eq!(serialized.hostname, "internal.svc");
        assert_eq!(serialized.host, "internal.svc:9000");
    }

    #[test]
    fn test_missing_host_is_protocol_error() {
        let req = Request::builder().uri("/status").body(()).unwrap();
        let err = SerializedRequest::from_parts(&parts(req), b"").unwrap_err();
        assert!(matches!(err, InterceptError::Protocol { .. }));
    }

    #[test]
    fn test_unknown_method_is_protocol_error() {
        let req = Request::builder()
            .method("PROPFIND")
            .uri("https://dav.example.com/")
            .body(())
            .unwrap();
        let err = SerializedRequest::from_parts(&parts(req), b"").unwrap_err();
        match err {
            InterceptError::Protocol { context, reason } => {
                assert_eq!(context.host, "dav.example.com");
                assert!(reason.contains("PROPFIND"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_scheme_is_protocol_error() {
        let req = Request::builder()
            .uri("ftp://files.example.com/a.txt")
            .body(())
            .unwrap();
        assert!(SerializedRequest::from_parts(&parts(req), b"").is_err());
    }

    #[test]
    fn test_binary_body_round_trips_through_base64() {
        let response = Response::builder()
            .status(200)
            .body(Bytes::from_static(&[0xff, 0x00, 0xfe]))
            .unwrap();
        let serialized = SerializedResponse::from_response(&response, None);
        assert_eq!(serialized.body_encoding, BodyEncoding::Base64);
        assert_eq!(serialized.body_bytes().unwrap().as_ref(), &[0xff, 0x00, 0xfe]);
    }

    #[test]
    fn test_destination_ignores_method_and_scheme() {
        let req = Request::builder()
            .method("PROPFIND")
            .uri("webdav://files.example.com:8443/a.txt")
            .body(())
            .unwrap();
        let destination = Destination::from_parts(&parts(req)).unwrap();
        assert_eq!(destination.host, "files.example.com:8443");
        assert_eq!(destination.hostname, "files.example.com");
        assert_eq!(destination.url(), "webdav://files.example.com:8443/a.txt");
    }

    #[test]
    fn test_destination_of_origin_form_request() {
        let req = Request::builder()
            .uri("/dav?depth=1")
            .header("host", "localhost:80")
            .body(())
            .unwrap();
        let destination = Destination::from_parts(&parts(req)).unwrap();
        assert_eq!(destination.host, "localhost");
        assert_eq!(destination.url(), "http://localhost/dav?depth=1");
    }

    #[test]
    fn test_parse_query_decodes_values() {
        let q = parse_query(Some("q=hello%20world&flag"));
        assert_eq!(q.get("q"), Some(&OneOrMany::One("hello world".to_string())));
        assert_eq!(q.get("flag"), Some(&OneOrMany::One(String::new())));
    }
}
