//! TLS for the interception listener.
//!
//! - `authority` - Root CA loading and per-domain leaf issuance
//! - `acceptor` - Loopback TLS termination with a leaf issued per connection

mod acceptor;
mod authority;

pub use acceptor::{accept, leaf_server_config, HandshakeTargets, TargetGuard};
pub use authority::{
    bundled_cert_path, bundled_key_path, CertificateAuthority, IssuedCertificate,
    LEAF_COMMON_NAME, LEAF_ORGANIZATION, LEAF_ORGANIZATIONAL_UNIT, LEAF_VALIDITY_DAYS,
};

use rustls::crypto::CryptoProvider;
use std::sync::Arc;

/// ALPN protocol spoken on the listener.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Crypto provider used for every rustls config built by this crate.
///
/// Selected explicitly since more than one provider feature is compiled in.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
