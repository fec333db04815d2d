//! Dispatch, CA and listener configuration.

use crate::tls::{bundled_cert_path, bundled_key_path};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where cache misses are sent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum DispatchConfig {
    /// Forward to the original destination
    #[default]
    Direct,
    /// Re-encode the call for a remote fake-data service
    Relay { endpoint: String },
}

/// Root CA used to issue leaves for intercepted TLS destinations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaConfig {
    /// Path to CA certificate file (PEM format)
    #[serde(default = "bundled_cert_path")]
    pub cert_path: PathBuf,
    /// Path to CA private key file (PKCS#8 PEM)
    #[serde(default = "bundled_key_path")]
    pub key_path: PathBuf,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: bundled_cert_path(),
            key_path: bundled_key_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Address the interception listener binds to; the port is always ephemeral
    #[serde(default = "default_listener_host")]
    pub host: String,
}

fn default_listener_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_listener_host(),
        }
    }
}
