//! Host whitelist: calls to these hosts bypass interception entirely.

use crate::error::InterceptError;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Hosts that are never intercepted unless the whitelist is overridden.
pub const DEFAULT_WHITELIST: &[&str] = &["127.0.0.1", "::1", "[::1]", "localhost"];

/// A whitelist entry as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WhitelistEntry {
    /// Literal host; `*` matches any run of characters.
    Pattern(String),
    /// Regular expression, used as given.
    Regex { regex: String },
}

impl WhitelistEntry {
    /// Compile to a regex. Literal patterns are anchored; regexes pass through.
    pub fn compile(&self) -> Result<Regex, InterceptError> {
        let source = match self {
            WhitelistEntry::Pattern(pattern) => wildcard_to_regex(pattern),
            WhitelistEntry::Regex { regex } => regex.clone(),
        };
        Regex::new(&source).map_err(|e| {
            InterceptError::Configuration(format!("invalid whitelist entry {self:?}: {e}"))
        })
    }
}

impl From<&str> for WhitelistEntry {
    fn from(pattern: &str) -> Self {
        WhitelistEntry::Pattern(pattern.to_string())
    }
}

/// Split on runs of `*`, escape each literal segment, join with `.*`, anchor.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut body = String::with_capacity(pattern.len() + 4);
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '*' {
            literal.push(c);
            continue;
        }
        while chars.peek() == Some(&'*') {
            chars.next();
        }
        body.push_str(&regex::escape(&literal));
        body.push_str(".*");
        literal.clear();
    }
    body.push_str(&regex::escape(&literal));
    format!("^{body}$")
}

/// Compile every entry, failing on the first invalid one.
pub fn compile(entries: &[WhitelistEntry]) -> Result<Vec<Regex>, InterceptError> {
    entries.iter().map(WhitelistEntry::compile).collect()
}

struct Compiled {
    entries: Vec<WhitelistEntry>,
    patterns: Vec<Regex>,
}

/// Backing list plus its compiled form, swapped together under one lock.
pub struct Whitelist {
    inner: RwLock<Compiled>,
}

impl Whitelist {
    pub fn new(entries: Vec<WhitelistEntry>) -> Result<Self, InterceptError> {
        let patterns = compile(&entries)?;
        Ok(Self {
            inner: RwLock::new(Compiled { entries, patterns }),
        })
    }

    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Compiled {
                entries: Vec::new(),
                patterns: Vec::new(),
            }),
        }
    }

    /// True iff `host` or `hostname` matches any compiled pattern.
    pub fn is_whitelisted(&self, host: &str, hostname: &str) -> bool {
        let inner = self.inner.read();
        inner
            .patterns
            .iter()
            .any(|re| re.is_match(host) || re.is_match(hostname))
    }

    /// Append entries. The new set is compiled before it becomes visible.
    pub fn add(&self, entries: Vec<WhitelistEntry>) -> Result<(), InterceptError> {
        let compiled = compile(&entries)?;
        let mut inner = self.inner.write();
        inner.entries.extend(entries);
        inner.patterns.extend(compiled);
        Ok(())
    }

    /// Replace all entries. On error the previous set stays in force.
    pub fn set(&self, entries: Vec<WhitelistEntry>) -> Result<(), InterceptError> {
        let patterns = compile(&entries)?;
        *self.inner.write() = Compiled { entries, patterns };
        Ok(())
    }

    pub fn entries(&self) -> Vec<WhitelistEntry> {
        self.inner.read().entries.clone()
    }
}

impl Default for Whitelist {
    fn default() -> Self {
        let entries = DEFAULT_WHITELIST.iter().map(|h| WhitelistEntry::from(*h)).collect();
        // Literal entries always compile.
        Self::new(entries).unwrap_or_else(|_| Self::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Whitelist {
        Whitelist::new(entries.iter().map(|e| WhitelistEntry::from(*e)).collect()).unwrap()
    }

    #[test]
    fn test_loopback_and_localhost() {
        let wl = list(&["127.0.0.1", "localhost"]);
        assert!(wl.is_whitelisted("localhost", "localhost"));
        assert!(wl.is_whitelisted("127.0.0.1:8080", "127.0.0.1"));
        assert!(!wl.is_whitelisted("localhost.example.com", "localhost.example.com"));
    }

    #[test]
    fn test_wildcard_segment() {
        let wl = list(&["api.*.com"]);
        assert!(wl.is_whitelisted("api.foo.com", "api.foo.com"));
        assert!(!wl.is_whitelisted("api.foo.org", "api.foo.org"));
        assert!(!wl.is_whitelisted("xapi.foo.com", "xapi.foo.com"));
    }

    #[test]
    fn test_wildcard_compilation() {
        assert_eq!(wildcard_to_regex("api.*.com"), r"^api\..*\.com$");
        assert_eq!(wildcard_to_regex("a***b"), "^a.*b$");
        assert_eq!(wildcard_to_regex("localhost"), "^localhost$");
    }

    #[test]
    fn test_literal_dots_are_escaped() {
        let wl = list(&["a.b"]);
        assert!(!wl.is_whitelisted("axb", "axb"));
    }

    #[test]
    fn test_leading_and_repeated_wildcards() {
        let wl = list(&["**.internal", "cdn*"]);
        assert!(wl.is_whitelisted("svc.internal", "svc.internal"));
        assert!(wl.is_whitelisted("cdn7.example.net", "cdn7.example.net"));
        assert!(list(&["*"]).is_whitelisted("anything", "anything"));
    }

    #[test]
    fn test_empty_whitelist() {
        let wl = list(&[]);
        assert!(!wl.is_whitelisted("example.com", "example.com"));
    }

    #[test]
    fn test_regex_entry_passes_through() {
        let wl = Whitelist::new(vec![WhitelistEntry::Regex {
            regex: r"\.test$".to_string(),
        }])
        .unwrap();
        assert!(wl.is_whitelisted("svc.test", "svc.test"));
        assert!(!wl.is_whitelisted("svc.prod", "svc.prod"));
    }

    #[test]
    fn test_add_and_set_recompile() {
        let wl = list(&["localhost"]);
        wl.add(vec!["*.example.com".into()]).unwrap();
        assert!(wl.is_whitelisted("api.example.com", "api.example.com"));
        assert_eq!(wl.entries().len(), 2);

        wl.set(vec!["only.me".into()]).unwrap();
        assert!(!wl.is_whitelisted("localhost", "localhost"));
        assert!(wl.is_whitelisted("only.me", "only.me"));
    }

    #[test]
    fn test_invalid_regex_keeps_previous_set() {
        let wl = list(&["localhost"]);
        let bad = WhitelistEntry::Regex {
            regex: "(".to_string(),
        };
        assert!(wl.set(vec![bad.clone()]).is_err());
        assert!(wl.add(vec![bad]).is_err());
        assert!(wl.is_whitelisted("localhost", "localhost"));
        assert_eq!(wl.entries().len(), 1);
    }

    #[test]
    fn test_default_covers_loopback() {
        let wl = Whitelist::default();
        assert!(wl.is_whitelisted("localhost:3000", "localhost"));
        assert!(wl.is_whitelisted("[::1]:8080", "[::1]"));
        assert!(!wl.is_whitelisted("example.com", "example.com"));
    }

    #[test]
    fn test_entries_deserialize_from_yaml() {
        let entries: Vec<WhitelistEntry> =
            serde_yaml::from_str("- localhost\n- regex: \"^10\\\\.\"\n").unwrap();
        assert_eq!(entries[0], WhitelistEntry::Pattern("localhost".to_string()));
        assert!(matches!(entries[1], WhitelistEntry::Regex { .. }));
    }
}
