//! Book-keeping hooks: where each call was served from, and a log sink.

use crate::fingerprint::Fingerprint;
use crate::request::{SerializedRequest, SerializedResponse};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Where a completed call's response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServedFrom {
    Cache,
    Network,
}

impl ServedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedFrom::Cache => "cache",
            ServedFrom::Network => "network",
        }
    }
}

/// Emitted once per fingerprinted call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    pub fingerprint: Fingerprint,
    pub request: SerializedRequest,
    pub response: SerializedResponse,
    pub served_from: ServedFrom,
}

/// Receives one event per resolved call.
pub trait CallListener: Send + Sync {
    fn on_call(&self, event: &CallEvent);
}

/// Listener that ignores every event.
#[derive(Debug, Default)]
pub struct NoopListener;

impl CallListener for NoopListener {
    fn on_call(&self, _event: &CallEvent) {}
}

/// Embedder-facing log sink.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to `tracing` under the `rift_intercept` target.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        info!(target: "rift_intercept", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "rift_intercept", "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_tracing_logger_forwards() {
        let logger = TracingLogger;
        logger.log("listener bound");
        logger.error("relay unreachable");
        assert!(logs_contain("listener bound"));
        assert!(logs_contain("relay unreachable"));
    }

    #[test]
    fn test_served_from_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&ServedFrom::Network).unwrap(),
            "\"network\""
        );
        assert_eq!(ServedFrom::Cache.as_str(), "cache");
    }
}
