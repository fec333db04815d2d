//! In-memory transport used to replay cached responses.
//!
//! An [`EmulatedSocket`] behaves like a connected TCP (or TLS) stream as far as
//! hyper's HTTP/1 client is concerned: whatever the client writes is captured,
//! and reads are served from a pre-serialized HTTP/1.1 response. Reads stay
//! pending until the client has flushed its request, so the client never sees
//! a response it has not asked for yet.
//!
//! Latency and timeouts are simulated: [`EmulatedSocket::apply_delay`] adds to
//! a counter instead of sleeping, and a timeout fires the moment the counter
//! passes the configured limit.

use crate::error::{CallContext, InterceptError};
use crate::headers::is_hop_by_hop;
use crate::request::{HttpMethod, Protocol, SerializedRequest, SerializedResponse};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

/// Callback fired once when the simulated timeout elapses.
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// Synthetic certificate reported by an authorized (TLS) emulated socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    pub subject: String,
    pub issuer: String,
    pub valid_from: String,
    pub valid_to: String,
}

impl PeerCertificate {
    fn placeholder() -> Self {
        Self {
            subject: "CN=rift-intercept".to_string(),
            issuer: "CN=Rift Intercept Root CA".to_string(),
            valid_from: "Jan  1 00:00:00 2024 GMT".to_string(),
            valid_to: "Jan  1 00:00:00 2044 GMT".to_string(),
        }
    }
}

pub struct EmulatedSocket {
    authorized: bool,
    readable: bool,
    writable: bool,
    accumulated_delay_ms: u64,
    timeout_ms: Option<u64>,
    on_timeout: Option<TimeoutCallback>,
    timed_out: bool,
    written: BytesMut,
    request_flushed: bool,
    response: Bytes,
    read_waker: Option<Waker>,
}

impl EmulatedSocket {
    /// A socket that will answer with `response` once a request is flushed.
    ///
    /// `authorized` marks the socket as a TLS stream.
    pub fn new(response: Bytes, authorized: bool) -> Self {
        Self {
            authorized,
            readable: true,
            writable: true,
            accumulated_delay_ms: 0,
            timeout_ms: None,
            on_timeout: None,
            timed_out: false,
            written: BytesMut::new(),
            request_flushed: false,
            response,
            read_waker: None,
        }
    }

    pub fn authorized(&self) -> bool {
        self.authorized
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn accumulated_delay_ms(&self) -> u64 {
        self.accumulated_delay_ms
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn set_no_delay(&mut self) -> &mut Self {
        self
    }

    pub fn set_keep_alive(&mut self) -> &mut Self {
        self
    }

    pub fn resume(&mut self) -> &mut Self {
        self
    }

    /// Arm the simulated timeout. `on_timeout` fires at most once.
    ///
    /// If the delay already accumulated exceeds `ms`, it fires immediately.
    pub fn set_timeout(&mut self, ms: u64, on_timeout: TimeoutCallback) -> &mut Self {
        self.timeout_ms = Some(ms);
        self.on_timeout = Some(on_timeout);
        self.check_timeout();
        self
    }

    /// Add simulated latency without waiting.
    pub fn apply_delay(&mut self, ms: u64) -> &mut Self {
        self.accumulated_delay_ms = self.accumulated_delay_ms.saturating_add(ms);
        self.check_timeout();
        self
    }

    fn check_timeout(&mut self) {
        let Some(limit) = self.timeout_ms else {
            return;
        };
        if self.timed_out || self.accumulated_delay_ms <= limit {
            return;
        }
        self.timed_out = true;
        debug!(
            "Emulated socket timed out after {}ms (limit {}ms)",
            self.accumulated_delay_ms, limit
        );
        if let Some(callback) = self.on_timeout.take() {
            callback();
        }
        self.wake_reader();
    }

    pub fn peer_certificate(&self) -> Option<PeerCertificate> {
        self.authorized.then(PeerCertificate::placeholder)
    }

    /// Close both directions. Reads return EOF, writes fail with `BrokenPipe`.
    pub fn destroy(&mut self) {
        self.readable = false;
        self.writable = false;
        self.wake_reader();
    }

    /// Bytes the client has written so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

impl AsyncRead for EmulatedSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.timed_out {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "emulated socket timed out",
            )));
        }
        if !self.readable {
            return Poll::Ready(Ok(()));
        }
        if !self.request_flushed {
            self.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = self.response.len().min(buf.remaining());
        if n > 0 {
            buf.put_slice(&self.response[..n]);
            self.response.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for EmulatedSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.writable {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "emulated socket destroyed",
            )));
        }
        self.written.put_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.written.is_empty() && !self.request_flushed {
            self.request_flushed = true;
            self.wake_reader();
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.writable = false;
        Poll::Ready(Ok(()))
    }
}

fn invalid_data(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Render a stored response as HTTP/1.1 wire bytes.
///
/// Hop-by-hop headers are dropped and `content-length` is recomputed from the
/// decoded body.
pub fn encode_response(response: &SerializedResponse) -> io::Result<Bytes> {
    let status = StatusCode::from_u16(response.status_code)
        .map_err(|e| invalid_data(format!("invalid status {}: {e}", response.status_code)))?;
    let body = response
        .body_bytes()
        .map_err(|e| invalid_data(format!("body is not valid base64: {e}")))?;

    let mut wire = BytesMut::with_capacity(256 + body.len());
    wire.put_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, values) in &response.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        for value in values.values() {
            if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
                return Err(invalid_data(format!("malformed header '{name}'")));
            }
            wire.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
    }
    wire.put_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    wire.put_slice(&body);
    Ok(wire.freeze())
}

/// Knobs for a single replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Simulated timeout; a recorded latency above it fails the replay.
    pub timeout_ms: Option<u64>,
}

fn replay_request(request: &SerializedRequest) -> Result<Request<Full<Bytes>>, InterceptError> {
    let mut builder = Request::builder()
        .method(request.method.as_str().to_ascii_uppercase().as_str())
        .uri(request.path.as_str())
        .header(hyper::header::HOST, request.host.as_str());
    for (name, values) in &request.headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        for value in values.values() {
            builder = builder.header(name.as_str(), value);
        }
    }
    let body = match request.method {
        HttpMethod::Get | HttpMethod::Head => Bytes::new(),
        _ => request.body.clone().map(Bytes::from).unwrap_or_default(),
    };
    builder
        .body(Full::new(body))
        .map_err(|e| InterceptError::protocol(request.context(), e.to_string()))
}

/// Serve `response` to `request` through hyper's HTTP/1 client running over an
/// [`EmulatedSocket`].
pub async fn replay(
    request: &SerializedRequest,
    response: &SerializedResponse,
    options: ReplayOptions,
) -> Result<Response<Bytes>, InterceptError> {
    let context: CallContext = request.context();
    let wire = encode_response(response).map_err(|e| InterceptError::CacheCorruption {
        context: context.clone(),
        reason: e.to_string(),
    })?;

    let mut socket = EmulatedSocket::new(wire, request.protocol == Protocol::Https);
    socket.set_no_delay().set_keep_alive();
    if let Some(limit) = options.timeout_ms {
        let host = request.host.clone();
        socket.set_timeout(
            limit,
            Box::new(move || warn!("Replay for {} exceeded {}ms timeout", host, limit)),
        );
    }
    if let Some(latency) = response.latency_ms {
        socket.apply_delay(latency);
    }

    let (mut sender, conn) = http1::handshake(TokioIo::new(socket))
        .await
        .map_err(|e| InterceptError::network(context.clone(), e))?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Emulated connection closed: {}", err);
        }
    });

    let outgoing = replay_request(request)?;
    let replayed = sender
        .send_request(outgoing)
        .await
        .map_err(|e| InterceptError::network(context.clone(), e))?;
    let (parts, body) = replayed.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| InterceptError::network(context, e))?
        .to_bytes();
    Ok(Response::from_parts(parts, body))
}
