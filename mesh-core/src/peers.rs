//! Known peers: address, last sighting, measured latency.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRecord {
    pub peer_id: String,
    /// Source IP of the last sighting with the peer's advertised sync port.
    pub addr: SocketAddr,
    pub last_seen: u64,
    pub latency_ms: Option<f64>,
    pub metadata: BTreeMap<String, String>,
}

/// Result of recording a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    New,
    Known,
    /// Unknown peer refused because the table is at capacity.
    Full,
}

/// Peer table shared by discovery, sessions and the re-sync loop. Entries are never expired
/// here; the owner drops them with [`PeerTable::remove`].
pub struct PeerTable {
    peers: RwLock<HashMap<String, PeerRecord>>,
    max_peers: usize,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::with_max_peers(usize::MAX)
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that refuses new peers once it holds `max_peers`.
    pub fn with_max_peers(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// Record a sighting at `now`. Known peers only get address and last-seen refreshed.
    pub fn observe(&self, peer_id: &str, addr: SocketAddr, now: u64) -> Sighting {
        let mut peers = self.write();
        let len = peers.len();
        match peers.get_mut(peer_id) {
            Some(p) => {
                p.addr = addr;
                p.last_seen = now;
                Sighting::Known
            }
            None if len >= self.max_peers => Sighting::Full,
            None => {
                peers.insert(
                    peer_id.to_string(),
                    PeerRecord {
                        peer_id: peer_id.to_string(),
                        addr,
                        last_seen: now,
                        latency_ms: None,
                        metadata: BTreeMap::new(),
                    },
                );
                Sighting::New
            }
        }
    }

    /// Successful handshake: refresh the peer and store the hello round trip.
    pub fn record_handshake(
        &self,
        peer_id: &str,
        addr: SocketAddr,
        latency_ms: Option<f64>,
        now: u64,
    ) -> Sighting {
        let sighting = self.observe(peer_id, addr, now);
        if let Some(p) = self.write().get_mut(peer_id) {
            if latency_ms.is_some() {
                p.latency_ms = latency_ms;
            }
        }
        sighting
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        self.write().remove(peer_id)
    }

    pub fn at_capacity(&self) -> bool {
        self.len() >= self.max_peers
    }

    pub fn set_metadata(&self, peer_id: &str, key: impl Into<String>, value: impl Into<String>) -> bool {
        match self.write().get_mut(peer_id) {
            Some(p) => {
                p.metadata.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.read().get(peer_id).cloned()
    }

    /// All peers ordered by id.
    pub fn all(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.read().values().cloned().collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_sighting_is_new_then_known() {
        let table = PeerTable::new();
        assert_eq!(table.observe("aaaa", addr("10.0.0.2:5000"), 1), Sighting::New);
        assert_eq!(table.observe("aaaa", addr("10.0.0.3:5000"), 7), Sighting::Known);
        let p = table.get("aaaa").unwrap();
        assert_eq!(p.addr, addr("10.0.0.3:5000"));
        assert_eq!(p.last_seen, 7);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn handshake_keeps_last_latency() {
        let table = PeerTable::new();
        table.record_handshake("aaaa", addr("10.0.0.2:5000"), Some(3.5), 1);
        table.record_handshake("aaaa", addr("10.0.0.2:5000"), None, 2);
        let p = table.get("aaaa").unwrap();
        assert_eq!(p.latency_ms, Some(3.5));
        assert_eq!(p.last_seen, 2);
    }

    #[test]
    fn metadata_only_for_known_peers() {
        let table = PeerTable::new();
        assert!(!table.set_metadata("aaaa", "name", "kitchen"));
        table.observe("aaaa", addr("10.0.0.2:5000"), 1);
        assert!(table.set_metadata("aaaa", "name", "kitchen"));
        assert_eq!(table.get("aaaa").unwrap().metadata["name"], "kitchen");
    }

    #[test]
    fn capacity_refuses_only_new_peers() {
        let table = PeerTable::with_max_peers(2);
        assert_eq!(table.observe("aaaa", addr("10.0.0.2:1"), 1), Sighting::New);
        assert_eq!(table.observe("bbbb", addr("10.0.0.3:1"), 1), Sighting::New);
        assert!(table.at_capacity());
        assert_eq!(table.observe("cccc", addr("10.0.0.4:1"), 1), Sighting::Full);
        assert_eq!(
            table.record_handshake("cccc", addr("10.0.0.4:1"), Some(1.0), 1),
            Sighting::Full
        );
        assert!(table.get("cccc").is_none());
        assert_eq!(table.observe("aaaa", addr("10.0.0.2:1"), 2), Sighting::Known);

        let gone = table.remove("bbbb").unwrap();
        assert_eq!(gone.addr, addr("10.0.0.3:1"));
        assert!(table.remove("bbbb").is_none());
        assert!(!table.at_capacity());
        assert_eq!(table.observe("cccc", addr("10.0.0.4:1"), 3), Sighting::New);
    }

    #[test]
    fn all_is_sorted() {
        let table = PeerTable::new();
        table.observe("cccc", addr("10.0.0.4:1"), 1);
        table.observe("aaaa", addr("10.0.0.2:1"), 1);
        let ids: Vec<_> = table.all().into_iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec!["aaaa", "cccc"]);
    }
}
