//! Per-session story of resolved fingerprints.

use super::Fingerprint;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
struct StoryState {
    /// Most recent first.
    entries: Vec<Fingerprint>,
    reported: HashSet<Fingerprint>,
}

/// Ordered list of the fingerprints resolved in this session.
///
/// Every mutation happens under a single lock acquisition and never yields, so
/// two completing calls cannot interleave into an inconsistent story.
#[derive(Default)]
pub struct Story {
    state: Mutex<StoryState>,
}

impl Story {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current entries, most recent first.
    pub fn snapshot(&self) -> Vec<Fingerprint> {
        self.state.lock().entries.clone()
    }

    pub fn prepend(&self, fingerprint: Fingerprint) {
        self.state.lock().entries.insert(0, fingerprint);
    }

    /// Compute a fingerprint from the current story and prepend it, atomically.
    ///
    /// Concurrent structurally-identical calls therefore always see different
    /// stories and receive different fingerprints.
    pub fn advance<F>(&self, compute: F) -> Fingerprint
    where
        F: FnOnce(&[Fingerprint]) -> Fingerprint,
    {
        let mut state = self.state.lock();
        let fingerprint = compute(&state.entries);
        state.entries.insert(0, fingerprint.clone());
        fingerprint
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.state.lock().entries.contains(fingerprint)
    }

    /// Check-and-set guard for book-keeping.
    ///
    /// Returns `true` exactly once per fingerprint in the story; unknown
    /// fingerprints are never reported.
    pub fn mark_reported(&self, fingerprint: &Fingerprint) -> bool {
        let mut state = self.state.lock();
        if !state.entries.contains(fingerprint) {
            return false;
        }
        state.reported.insert(fingerprint.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.reported.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    #[test]
    fn test_prepend_keeps_most_recent_first() {
        let story = Story::new();
        story.prepend(fp("00000001"));
        story.prepend(fp("00000002"));
        assert_eq!(story.snapshot(), vec![fp("00000002"), fp("00000001")]);
    }

    #[test]
    fn test_advance_sees_previous_entries() {
        let story = Story::new();
        let first = story.advance(|entries| {
            assert!(entries.is_empty());
            fp("aaaaaaaa")
        });
        let second = story.advance(|entries| {
            assert_eq!(entries, &[fp("aaaaaaaa")]);
            fp("bbbbbbbb")
        });
        assert_eq!(first, fp("aaaaaaaa"));
        assert_eq!(second, fp("bbbbbbbb"));
        assert_eq!(story.len(), 2);
    }

    #[test]
    fn test_mark_reported_once() {
        let story = Story::new();
        story.prepend(fp("cafebabe"));
        assert!(story.mark_reported(&fp("cafebabe")));
        assert!(!story.mark_reported(&fp("cafebabe")));
        assert!(!story.mark_reported(&fp("00000000")));
    }

    #[test]
    fn test_clear() {
        let story = Story::new();
        story.prepend(fp("cafebabe"));
        story.clear();
        assert!(story.is_empty());
        assert!(!story.contains(&fp("cafebabe")));
    }
}
