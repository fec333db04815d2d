//! Per-call state machine.

use crate::error::CallContext;
use tracing::{debug, warn};

/// Where an intercepted call is in its lifecycle.
///
/// ```text
/// Created -> Whitelisted -> Passthrough
/// Created -> Fingerprinted -> CacheHit -> Replayed
/// Created -> Fingerprinted -> CacheMiss -> Forwarding -> Recorded
/// ```
///
/// A cache hit whose payload cannot be replayed falls back to `CacheMiss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created,
    Whitelisted,
    Passthrough,
    Fingerprinted,
    CacheHit,
    Replayed,
    CacheMiss,
    Forwarding,
    Recorded,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Created, Whitelisted)
                | (Whitelisted, Passthrough)
                | (Created, Fingerprinted)
                | (Fingerprinted, CacheHit)
                | (Fingerprinted, CacheMiss)
                | (CacheHit, Replayed)
                | (CacheHit, CacheMiss)
                | (CacheMiss, Forwarding)
                | (Forwarding, Recorded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Passthrough | CallState::Replayed | CallState::Recorded
        )
    }

    /// Metric label for a call that finished in this state.
    pub fn outcome(self) -> &'static str {
        match self {
            CallState::Passthrough => "passthrough",
            CallState::Replayed => "replayed",
            CallState::Recorded => "recorded",
            _ => "error",
        }
    }
}

/// Tracks one call's state and logs each transition.
pub(crate) struct CallTrace {
    state: CallState,
    context: CallContext,
}

impl CallTrace {
    pub(crate) fn new(context: CallContext) -> Self {
        Self {
            state: CallState::Created,
            context,
        }
    }

    pub(crate) fn state(&self) -> CallState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: CallState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "Unexpected transition {:?} -> {:?} for {}",
                self.state, next, self.context
            );
        }
        debug!(
            "{}{}: {:?} -> {:?}",
            self.context.host, self.context.path, self.state, next
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_paths_are_valid() {
        use CallState::*;
        let paths: &[&[CallState]] = &[
            &[Created, Whitelisted, Passthrough],
            &[Created, Fingerprinted, CacheHit, Replayed],
            &[Created, Fingerprinted, CacheMiss, Forwarding, Recorded],
            &[Created, Fingerprinted, CacheHit, CacheMiss, Forwarding, Recorded],
        ];
        for path in paths {
            for pair in path.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
            }
            assert!(path[path.len() - 1].is_terminal());
        }
    }

    #[test]
    fn test_skipping_states_is_invalid() {
        use CallState::*;
        assert!(!Created.can_transition_to(CacheHit));
        assert!(!Fingerprinted.can_transition_to(Recorded));
        assert!(!Whitelisted.can_transition_to(Fingerprinted));
        assert!(!Replayed.can_transition_to(Created));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(CallState::Passthrough.outcome(), "passthrough");
        assert_eq!(CallState::Replayed.outcome(), "replayed");
        assert_eq!(CallState::Recorded.outcome(), "recorded");
        assert_eq!(CallState::Forwarding.outcome(), "error");
    }

    #[test]
    fn test_trace_follows_transitions() {
        let mut trace = CallTrace::new(CallContext::new("api.example.com", "/v1/users"));
        assert_eq!(trace.state(), CallState::Created);
        trace.advance(CallState::Fingerprinted);
        trace.advance(CallState::CacheMiss);
        assert_eq!(trace.state(), CallState::CacheMiss);
    }
}
