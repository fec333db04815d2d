use super::{crypto_provider, CertificateAuthority, ALPN_HTTP1};
use crate::error::InterceptError;
use parking_lot::Mutex;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

/// Serves one pre-issued leaf for every handshake.
struct IssuedLeaf(Arc<CertifiedKey>);

impl fmt::Debug for IssuedLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedLeaf").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for IssuedLeaf {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Server config presenting `leaf`, HTTP/1.1 only.
pub fn leaf_server_config(leaf: Arc<CertifiedKey>) -> Result<ServerConfig, InterceptError> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| InterceptError::Configuration(format!("Failed to build TLS configuration: {e}")))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IssuedLeaf(leaf)));
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(config)
}

/// Destinations of pending loopback TLS connections, keyed by the client's
/// local address.
///
/// rustls sends no SNI for IP-literal server names, so the connecting side
/// registers the destination here before the handshake and the listener looks
/// it up by peer address.
#[derive(Clone, Default)]
pub struct HandshakeTargets {
    pending: Arc<Mutex<HashMap<SocketAddr, String>>>,
}

impl HandshakeTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `host` for the connection whose client end is `client`.
    pub fn register(&self, client: SocketAddr, host: impl Into<String>) -> TargetGuard {
        self.pending.lock().insert(client, host.into());
        TargetGuard {
            client,
            targets: self.clone(),
        }
    }

    pub fn take(&self, client: &SocketAddr) -> Option<String> {
        self.pending.lock().remove(client)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a registered target on drop if the listener never claimed it.
#[must_use = "dropping the guard unregisters the target"]
pub struct TargetGuard {
    client: SocketAddr,
    targets: HandshakeTargets,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        self.targets.take(&self.client);
    }
}

fn handshake_error(e: InterceptError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Terminate TLS on a loopback connection from `peer`.
///
/// The leaf is issued for the SNI name, or for the target registered for
/// `peer` when the client sent none. Key generation runs on the blocking pool.
pub async fn accept<IO>(
    stream: IO,
    peer: SocketAddr,
    authority: Arc<CertificateAuthority>,
    targets: &HandshakeTargets,
) -> io::Result<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
    let registered = targets.take(&peer);
    let domain = match start.client_hello().server_name() {
        Some(sni) => sni.to_string(),
        None => registered.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("TLS handshake from {peer} has neither SNI nor a registered target"),
            )
        })?,
    };
    debug!("Issuing leaf for {} on connection from {}", domain, peer);

    let issued = tokio::task::spawn_blocking(move || authority.issue(&domain))
        .await
        .map_err(io::Error::other)?
        .map_err(handshake_error)?;
    let leaf = issued.certified_key().map_err(handshake_error)?;
    let config = leaf_server_config(Arc::new(leaf)).map_err(handshake_error)?;
    start.into_stream(Arc::new(config)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::TlsConnector;

    async fn echo_once(
        name: &str,
        register: Option<&str>,
    ) -> (io::Result<Vec<u8>>, HandshakeTargets) {
        let ca = CertificateAuthority::bundled().await.unwrap();
        let connector = TlsConnector::from(Arc::new(ca.client_config().unwrap()));
        let targets = HandshakeTargets::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_targets = targets.clone();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let Ok(mut tls) = accept(stream, peer, ca, &server_targets).await else {
                return;
            };
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let _guard = register.map(|host| targets.register(stream.local_addr().unwrap(), host));
        let server_name = ServerName::try_from(name.to_string()).unwrap();
        let result: io::Result<Vec<u8>> = async {
            let mut tls = connector.connect(server_name, stream).await?;
            assert_eq!(tls.get_ref().1.alpn_protocol(), Some(ALPN_HTTP1));
            tls.write_all(b"ping").await?;
            tls.flush().await?;
            let mut echoed = vec![0u8; 4];
            tls.read_exact(&mut echoed).await?;
            Ok(echoed)
        }
        .await;
        let _ = server.await;
        (result, targets)
    }

    #[tokio::test]
    async fn test_leaf_issued_for_sni_name() {
        let (result, targets) = echo_once("api.example.com", None).await;
        assert_eq!(result.unwrap(), b"ping");
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn test_ip_literal_uses_registered_target() {
        let (result, targets) = echo_once("10.1.2.3", Some("10.1.2.3")).await;
        assert_eq!(result.unwrap(), b"ping");
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_literal_uses_registered_target() {
        let (result, _) = echo_once("2001:db8::1", Some("2001:db8::1")).await;
        assert_eq!(result.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_ip_literal_without_target_is_refused() {
        let (result, _) = echo_once("10.1.2.3", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_untrusted_root_is_rejected_by_client() {
        let ca = CertificateAuthority::bundled().await.unwrap();
        let client = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client));

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let targets = HandshakeTargets::new();
        let server = tokio::spawn(async move { accept(server_io, peer, ca, &targets).await.is_ok() });

        let name = ServerName::try_from("api.example.com").unwrap();
        assert!(connector.connect(name, client_io).await.is_err());
        let _ = server.await;
    }

    #[test]
    fn test_dropped_guard_unregisters() {
        let targets = HandshakeTargets::new();
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let guard = targets.register(client, "10.0.0.1");
        assert_eq!(targets.len(), 1);
        drop(guard);
        assert!(targets.take(&client).is_none());
    }
}
