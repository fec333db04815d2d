//! Error types for interception.
//!
//! Per-call errors carry a [`CallContext`] so downstream reporting can say which
//! request failed without re-deriving it.

use crate::fingerprint::Fingerprint;
use std::fmt;

/// Boxed error used for transport and persistence sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identifies the call an error belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub fingerprint: Option<Fingerprint>,
    pub host: String,
    pub path: String,
}

impl CallContext {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            fingerprint: None,
            host: host.into(),
            path: path.into(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fingerprint {
            Some(fp) => write!(f, "{}{} [{}]", self.host, self.path, fp),
            None => write!(f, "{}{}", self.host, self.path),
        }
    }
}

/// Error types for interception
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Protocol error for {context}: {reason}")]
    Protocol { context: CallContext, reason: String },

    #[error("Correlation failure for {context}: {reason}")]
    Correlation { context: CallContext, reason: String },

    #[error("Cached payload for {context} is unreadable: {reason}")]
    CacheCorruption { context: CallContext, reason: String },

    #[error("Network error for {context}: {source}")]
    Network {
        context: CallContext,
        #[source]
        source: BoxError,
    },

    #[error("Certificate issuance for '{domain}' failed: {reason}")]
    Certificate { domain: String, reason: String },

    #[error("Persistence error for {context}: {source}")]
    Persistence {
        context: CallContext,
        #[source]
        source: PersistenceError,
    },
}

impl InterceptError {
    pub fn protocol(context: CallContext, reason: impl Into<String>) -> Self {
        Self::Protocol {
            context,
            reason: reason.into(),
        }
    }

    pub fn network(context: CallContext, source: impl Into<BoxError>) -> Self {
        Self::Network {
            context,
            source: source.into(),
        }
    }

    /// The call this error belongs to, if it is a per-call error.
    pub fn context(&self) -> Option<&CallContext> {
        match self {
            Self::Configuration(_) | Self::Certificate { .. } => None,
            Self::Protocol { context, .. }
            | Self::Correlation { context, .. }
            | Self::CacheCorruption { context, .. }
            | Self::Network { context, .. }
            | Self::Persistence { context, .. } => Some(context),
        }
    }
}

/// Errors raised by [`Persistence`](crate::persistence::Persistence) implementations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("stored payload for {fingerprint} is corrupt: {reason}")]
    Corrupt {
        fingerprint: Fingerprint,
        reason: String,
    },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display_includes_fingerprint() {
        let ctx = CallContext::new("api.example.com", "/v1/users")
            .with_fingerprint(Fingerprint::from_hex("deadbeef"));
        assert_eq!(ctx.to_string(), "api.example.com/v1/users [deadbeef]");
    }

    #[test]
    fn test_network_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = InterceptError::network(CallContext::new("h", "/p"), io);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "refused");
        assert_eq!(err.context().unwrap().host, "h");
    }

    #[test]
    fn test_configuration_has_no_context() {
        let err = InterceptError::Configuration("missing CA".to_string());
        assert!(err.context().is_none());
    }
}
