//! Cache resolution policy.

use serde::{Deserialize, Serialize};

/// How a fingerprinted call is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ResolverPolicy {
    /// Always go to the network and record the result
    AlwaysLive,
    /// Replay when a recording exists, otherwise go live and record
    #[default]
    LiveIfUncached,
    /// Replay; a missing or unreadable recording degrades to a live call
    AlwaysCached,
}

impl ResolverPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolverPolicy::AlwaysLive => "alwaysLive",
            ResolverPolicy::LiveIfUncached => "liveIfUncached",
            ResolverPolicy::AlwaysCached => "alwaysCached",
        }
    }
}
