//! Real transport for calls that leave the process.
//!
//! Everything that actually reaches the network goes through an [`Upstream`]:
//! whitelisted passthrough calls, direct forwards and relay calls. Tests swap
//! in a recording double.

use crate::config::ConnectionPoolConfig;
use crate::error::{BoxError, InterceptError};
use crate::tls::crypto_provider;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::info;

/// Sends a fully buffered request and returns the fully buffered response.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError>;
}

/// Type alias for the pooled HTTP client.
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Pooled hyper-util client with rustls and the platform's root store.
#[derive(Clone)]
pub struct HyperUpstream {
    client: HttpClient,
}

impl HyperUpstream {
    /// Client trusting the platform's native roots.
    pub fn new(pool: &ConnectionPoolConfig) -> Result<Self, InterceptError> {
        let builder = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(crypto_provider())
            .map_err(|e| {
                InterceptError::Configuration(format!("Failed to load native root certificates: {e}"))
            })?;
        let https_connector = builder
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector(pool));
        Ok(Self {
            client: build_client(pool, https_connector),
        })
    }

    /// Client with a caller-supplied TLS configuration.
    pub fn with_tls_config(pool: &ConnectionPoolConfig, tls: rustls::ClientConfig) -> Self {
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector(pool));
        Self {
            client: build_client(pool, https_connector),
        }
    }
}

fn http_connector(pool: &ConnectionPoolConfig) -> HttpConnector {
    let mut http_connector = HttpConnector::new();
    http_connector.set_keepalive(Some(Duration::from_secs(pool.keepalive_timeout_secs)));
    http_connector.set_connect_timeout(Some(Duration::from_secs(pool.connect_timeout_secs)));
    http_connector.enforce_http(false); // Allow both HTTP and HTTPS
    http_connector
}

fn build_client(
    pool: &ConnectionPoolConfig,
    connector: hyper_rustls::HttpsConnector<HttpConnector>,
) -> HttpClient {
    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool.idle_timeout_secs))
        .pool_max_idle_per_host(pool.max_idle_per_host)
        .build(connector);

    info!(
        "Connection pool configured (HTTP/1.1): max_idle={}, idle_timeout={}s, keepalive={}s",
        pool.max_idle_per_host, pool.idle_timeout_secs, pool.keepalive_timeout_secs
    );
    client
}

#[async_trait]
impl Upstream for HyperUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        let response = self.client.request(request.map(Full::new)).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_sends_and_buffers_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                Ok::<_, Infallible>(Response::new(Full::new(body)))
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let upstream = HyperUpstream::with_tls_config(
            &ConnectionPoolConfig::default(),
            rustls::ClientConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        );
        let request = Request::builder()
            .method("POST")
            .uri(format!("http://{addr}/echo"))
            .body(Bytes::from_static(b"hello"))
            .unwrap();
        let response = upstream.send(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = HyperUpstream::with_tls_config(
            &ConnectionPoolConfig::default(),
            rustls::ClientConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        );
        let request = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(Bytes::new())
            .unwrap();
        assert!(upstream.send(request).await.is_err());
    }
}
