//! Ordered multi-valued header table and the hop-by-hop filter.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Headers that apply only to a single transport hop and must never be
/// forwarded (RFC 7230 §6.1, plus the de-facto `Proxy-Connection`).
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Header names mapped to their ordered list of values. Name order and value
/// order are both preserved; lookups are case-insensitive. On the wire this
/// serializes as a JSON object whose values are arrays of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderTable(IndexMap<String, Vec<String>>);

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// First value of `name`, matched case-insensitively.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.keys().any(|k| k.eq_ignore_ascii_case(name))
    }

    /// Drop every entry matching `name` case-insensitively.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|k, _| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this table without the hop-by-hop set. Order and multiplicity
    /// of the surviving entries are untouched; applying it twice is the same
    /// as applying it once.
    pub fn without_hop_by_hop(&self) -> HeaderTable {
        let mut out = HeaderTable::new();
        for (name, values) in &self.0 {
            if is_hop_by_hop(name) {
                continue;
            }
            for value in values {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeaderTable {
        let mut table = HeaderTable::new();
        table.append("Connection", "keep-alive");
        table.append("Proxy-Connection", "keep-alive");
        table.append("Accept", "text/html");
        table.append("Accept", "application/json");
        table.append("X-Trace", "abc");
        table.append("Transfer-Encoding", "chunked");
        table
    }

    #[test]
    fn test_filter_removes_hop_by_hop() {
        let filtered = sample().without_hop_by_hop();
        assert!(!filtered.contains("connection"));
        assert!(!filtered.contains("proxy-connection"));
        assert!(!filtered.contains("transfer-encoding"));
        assert!(filtered.contains("accept"));
        assert!(filtered.contains("x-trace"));
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let mut table = HeaderTable::new();
        table.append("CONNECTION", "close");
        table.append("Keep-Alive", "timeout=5");
        table.append("X-Foo", "bar");
        let filtered = table.without_hop_by_hop();
        assert!(!filtered.contains("connection"));
        assert!(!filtered.contains("keep-alive"));
        assert_eq!(filtered.get_first("x-foo"), Some("bar"));
    }

    #[test]
    fn test_filter_preserves_order_and_multiplicity() {
        let filtered = sample().without_hop_by_hop();
        let entries: Vec<(&str, &[String])> = filtered
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "Accept");
        assert_eq!(entries[0].1, &["text/html".to_string(), "application/json".to_string()]);
        assert_eq!(entries[1].0, "X-Trace");
    }

    #[test]
    fn test_filter_is_idempotent() {
        let once = sample().without_hop_by_hop();
        let twice = once.without_hop_by_hop();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_get_first_case_insensitive() {
        let table = sample();
        assert_eq!(table.get_first("accept"), Some("text/html"));
        assert_eq!(table.get_first("ACCEPT"), Some("text/html"));
        assert_eq!(table.get_first("missing"), None);
    }

    #[test]
    fn test_remove_case_insensitive() {
        let mut table = sample();
        table.remove("ACCEPT");
        assert!(!table.contains("accept"));
        assert!(table.contains("x-trace"));
    }

    #[test]
    fn test_wire_shape() {
        let mut table = HeaderTable::new();
        table.append("Content-Type", "text/plain");
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"Content-Type":["text/plain"]}"#);
    }
}
