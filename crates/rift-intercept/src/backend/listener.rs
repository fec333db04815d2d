//! Loopback listener that receives the server-side view of every cache miss.
//!
//! Connections starting with a TLS record are terminated with a leaf issued for
//! that connection's destination; everything else is served as plain HTTP/1.1.

use crate::correlator::{CallHandle, RequestCorrelator};
use crate::error::InterceptError;
use crate::events::{CallEvent, CallListener, ServedFrom};
use crate::fingerprint::Story;
use crate::headers::{is_hop_by_hop, X_RIFT_CORRELATION_ERROR};
use crate::persistence::{Persistence, RequestMetadata};
use crate::request::SerializedResponse;
use crate::resolver::ResponseResolver;
use crate::tls::{self, CertificateAuthority, HandshakeTargets};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// Everything a connection task needs, shared across connections.
pub(crate) struct ListenerContext {
    pub correlator: RequestCorrelator,
    pub resolver: Arc<dyn ResponseResolver>,
    pub persistence: Arc<dyn Persistence>,
    pub story: Arc<Story>,
    pub call_listener: Arc<dyn CallListener>,
    pub authority: Arc<CertificateAuthority>,
    pub targets: HandshakeTargets,
}

/// Accept connections until the task is aborted.
pub(crate) async fn serve(listener: TcpListener, context: Arc<ListenerContext>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("Listener accept failed: {}", err);
                continue;
            }
        };
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            serve_connection(stream, remote_addr, context).await;
        });
    }
}

async fn serve_connection(stream: TcpStream, remote_addr: SocketAddr, context: Arc<ListenerContext>) {
    let mut first = [0u8; 1];
    match stream.peek(&mut first).await {
        Ok(0) => return,
        Ok(_) => {}
        Err(err) => {
            error!("Failed to read from {}: {}", remote_addr, err);
            return;
        }
    }

    let service = {
        let context = Arc::clone(&context);
        service_fn(move |req| {
            let context = Arc::clone(&context);
            async move { handle_call(&context, req).await }
        })
    };

    if first[0] == TLS_HANDSHAKE {
        let authority = Arc::clone(&context.authority);
        match tls::accept(stream, remote_addr, authority, &context.targets).await {
            Ok(tls_stream) => {
                let io = TokioIo::new(tls_stream);
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving HTTPS connection from {}: {}", remote_addr, err);
                }
            }
            Err(err) => {
                error!("TLS handshake failed from {}: {}", remote_addr, err);
            }
        }
    } else {
        let io = TokioIo::new(stream);
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            error!("Error serving HTTP connection from {}: {}", remote_addr, err);
        }
    }
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Answer a call that could not be correlated.
fn correlation_failure(reason: &str) -> Response<Full<Bytes>> {
    let mut response = status_only(StatusCode::INTERNAL_SERVER_ERROR);
    let value = HeaderValue::from_str(reason)
        .unwrap_or_else(|_| HeaderValue::from_static("correlation failure"));
    response
        .headers_mut()
        .insert(X_RIFT_CORRELATION_ERROR.clone(), value);
    response
}

async fn handle_call(
    context: &ListenerContext,
    mut request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let handle = match context.correlator.extract(&mut request) {
        Ok(handle) => handle,
        Err(InterceptError::Correlation { context: call, reason }) => {
            error!("Rejecting uncorrelated call to {}: {}", call, reason);
            return Ok(correlation_failure(&reason));
        }
        Err(other) => {
            error!("Rejecting uncorrelated call: {}", other);
            return Ok(correlation_failure(&other.to_string()));
        }
    };

    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            handle.fail(InterceptError::network(handle.context(), err));
            return Ok(status_only(StatusCode::BAD_REQUEST));
        }
    };

    let started = Instant::now();
    let response = match context
        .resolver
        .resolve(&handle, Request::from_parts(parts, body))
        .await
    {
        Ok(response) => response,
        Err(err) => {
            handle.fail(err);
            return Ok(status_only(StatusCode::BAD_GATEWAY));
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let recorded = SerializedResponse::from_response(&response, Some(latency_ms));
    if let Err(err) = record(context, &handle, &recorded) {
        error!("Failed to record {}: {}", handle.context(), err);
        handle.fail(err);
        return Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR));
    }

    if context.story.mark_reported(&handle.fingerprint) {
        context.call_listener.on_call(&CallEvent {
            fingerprint: handle.fingerprint.clone(),
            request: handle.request.clone(),
            response: recorded,
            served_from: ServedFrom::Network,
        });
    }

    let (mut parts, body) = response.into_parts();
    let hop: Vec<_> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        parts.headers.remove(name);
    }
    parts.headers.remove(CONTENT_LENGTH);
    Ok(Response::from_parts(parts, Full::new(body)))
}

fn record(
    context: &ListenerContext,
    handle: &CallHandle,
    response: &SerializedResponse,
) -> Result<(), InterceptError> {
    let persist_error = |source| InterceptError::Persistence {
        context: handle.context(),
        source,
    };
    context
        .persistence
        .save_response(&handle.fingerprint, response)
        .map_err(persist_error)?;
    let metadata = RequestMetadata {
        request: handle.request.clone(),
        story: handle.story.clone(),
        signature: handle.signature.clone(),
        redact: handle.rules.to_json(),
        recorded_at: Utc::now(),
    };
    context
        .persistence
        .save_request_metadata(&handle.fingerprint, &metadata)
        .map_err(persist_error)?;
    debug!("Recorded {}", handle.context());
    Ok(())
}

/// Bind the listener on an ephemeral port.
pub(crate) async fn bind(host: std::net::IpAddr) -> Result<(TcpListener, SocketAddr), InterceptError> {
    let listener = TcpListener::bind((host, 0)).await.map_err(|e| {
        InterceptError::Configuration(format!("failed to bind interception listener on {host}: {e}"))
    })?;
    let addr = listener.local_addr().map_err(|e| {
        InterceptError::Configuration(format!("interception listener has no local address: {e}"))
    })?;
    info!("Interception listener on {}", addr);
    Ok((listener, addr))
}
