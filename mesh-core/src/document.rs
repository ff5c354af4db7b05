//! Versioned documents and version vectors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Fields;

/// Peer id → monotonically increasing counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `peer`, 0 if the peer never wrote.
    pub fn get(&self, peer: &str) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    /// Raise `peer`'s counter to `counter`. Never lowers it.
    pub fn observe(&mut self, peer: &str, counter: u64) {
        let slot = self.0.entry(peer.to_string()).or_insert(0);
        if counter > *slot {
            *slot = counter;
        }
    }

    /// Bump `peer`'s own counter and return the new value.
    pub fn increment(&mut self, peer: &str) -> u64 {
        let slot = self.0.entry(peer.to_string()).or_insert(0);
        *slot += 1;
        *slot
    }

    /// True if some entry of `other` is ahead of ours.
    pub fn is_advanced_by(&self, other: &VersionVector) -> bool {
        other.iter().any(|(peer, c)| c > self.get(peer))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VersionVector {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self(entries.iter().map(|(p, c)| (p.to_string(), *c)).collect())
    }
}

/// A document in a collection, with its field snapshot and version vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub doc_id: String,
    pub fields: Fields,
    pub version: VersionVector,
}

impl Document {
    /// Empty document with no history; merge fills it.
    pub fn empty(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            fields: Fields::new(),
            version: VersionVector::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_never_lowers() {
        let mut vv = VersionVector::from([("a", 3)]);
        vv.observe("a", 2);
        assert_eq!(vv.get("a"), 3);
        vv.observe("a", 5);
        assert_eq!(vv.get("a"), 5);
        assert_eq!(vv.get("missing"), 0);
    }

    #[test]
    fn increment_own_counter() {
        let mut vv = VersionVector::new();
        assert_eq!(vv.increment("me"), 1);
        assert_eq!(vv.increment("me"), 2);
        assert_eq!(vv.len(), 1);
    }

    #[test]
    fn advanced_by_detects_any_newer_entry() {
        let local = VersionVector::from([("a", 2), ("b", 1)]);
        assert!(!local.is_advanced_by(&VersionVector::from([("a", 2)])));
        assert!(local.is_advanced_by(&VersionVector::from([("b", 2)])));
        assert!(local.is_advanced_by(&VersionVector::from([("c", 1)])));
    }

    #[test]
    fn serializes_as_plain_map() {
        let vv = VersionVector::from([("aaaa", 1), ("bbbb", 4)]);
        assert_eq!(serde_json::to_string(&vv).unwrap(), r#"{"aaaa":1,"bbbb":4}"#);
    }
}
