//! Host allow-list matching.
//!
//! The allow-list is built once at startup and shared read-only between all
//! connection tasks. A candidate host matches an entry if it is exactly equal
//! to the entry or is a strict subdomain of it (`api.example.com` matches
//! `example.com`; `example.com.evil.com` does not). Matching is
//! case-insensitive. An empty allow-list denies every host.

/// Request path that bypasses host checking so infrastructure monitoring can
/// reach the proxy without an allow-list entry.
pub const HEALTH_PATH: &str = "/health";

/// An immutable set of permitted domain suffixes.
#[derive(Debug, Clone)]
pub struct Allowlist {
    entries: Vec<String>,
}

impl Allowlist {
    /// Build an allow-list from configured entries.
    ///
    /// Entries are trimmed and lower-cased; empty entries are dropped.
    pub fn new(entries: Vec<String>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    /// Check whether `host` is permitted.
    ///
    /// `host` must be a bare hostname, port already stripped. Pure function,
    /// no I/O. Denies everything when the list is empty.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.entries.iter().any(|entry| {
            // Exact match, or suffix match sitting on a label boundary.
            host == *entry
                || (host.len() > entry.len() + 1
                    && host.ends_with(entry.as_str())
                    && host.as_bytes()[host.len() - entry.len() - 1] == b'.')
        })
    }

    /// Number of entries in the allow-list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The normalized entries.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Split a `host[:port]` string into its host part and an optional port.
///
/// Handles bracketed IPv6 literals (`[::1]:443`). A colon-separated suffix
/// that does not parse as a port leaves the input untouched so an unmatched
/// host fails closed downstream.
pub fn split_host_port(raw: &str) -> (&str, Option<u16>) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (raw, None);
    }

    match raw.rsplit_once(':') {
        // A second colon in the host part means a bare IPv6 literal.
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (raw, None),
        },
        _ => (raw, None),
    }
}
