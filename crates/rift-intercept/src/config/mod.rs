//! Configuration types for rift-intercept.

mod dispatch;
mod policy;
mod pool;

use crate::fingerprint::RedactionRules;
use crate::whitelist::{self, WhitelistEntry, DEFAULT_WHITELIST};
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

pub use dispatch::{CaConfig, DispatchConfig, ListenerConfig};
pub use policy::ResolverPolicy;
pub use pool::ConnectionPoolConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub policy: ResolverPolicy,

    /// Hosts that bypass interception. Replaces the default list when given.
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<WhitelistEntry>,

    /// Redaction rules applied before fingerprinting
    #[serde(default, skip_serializing_if = "RedactionRules::is_empty")]
    pub redact: RedactionRules,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub ca: CaConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    /// Simulated timeout for replayed responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_timeout_ms: Option<u64>,

    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
}

fn default_whitelist() -> Vec<WhitelistEntry> {
    DEFAULT_WHITELIST
        .iter()
        .map(|h| WhitelistEntry::from(*h))
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: ResolverPolicy::default(),
            whitelist: default_whitelist(),
            redact: RedactionRules::default(),
            user_id: None,
            signature: None,
            dispatch: DispatchConfig::default(),
            ca: CaConfig::default(),
            listener: ListenerConfig::default(),
            replay_timeout_ms: None,
            connection_pool: ConnectionPoolConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        whitelist::compile(&self.whitelist)?;

        if let DispatchConfig::Relay { ref endpoint } = self.dispatch {
            let uri: Uri = endpoint
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid relay endpoint '{endpoint}': {e}"))?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => anyhow::bail!(
                    "Relay endpoint '{endpoint}' must be an absolute http or https URL"
                ),
            }
            if uri.authority().is_none() {
                anyhow::bail!("Relay endpoint '{endpoint}' has no host");
            }
        }

        if self.listener.host.parse::<IpAddr>().is_err() {
            anyhow::bail!(
                "Listener host must be an IP address, got '{}'",
                self.listener.host
            );
        }

        if self.replay_timeout_ms == Some(0) {
            anyhow::bail!("replayTimeoutMs must be greater than zero");
        }

        Ok(())
    }
}
