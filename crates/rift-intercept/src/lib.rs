// Library exports for embedding and testing

// ===== Core =====
pub mod backend;
pub mod config;
pub mod correlator;
pub mod error;
pub mod fingerprint;
pub mod socket;
pub mod tls;
pub mod whitelist;

// ===== Collaborators and plumbing =====
pub mod events;
pub mod headers;
pub mod metrics;
pub mod persistence;
pub mod request;
pub mod resolver;
pub mod upstream;

pub use backend::{
    active_backend, BackendBuilder, CallState, Intercepted, InterceptedClient, InterceptionBackend,
};
pub use config::{Config, ResolverPolicy};
pub use error::{CallContext, InterceptError, PersistenceError};
pub use fingerprint::{Fingerprint, RedactionRules, Story};
pub use persistence::{MemoryPersistence, Persistence};
pub use request::{SerializedRequest, SerializedResponse};
pub use tls::CertificateAuthority;
pub use whitelist::Whitelist;

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}
