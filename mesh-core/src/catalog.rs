//! Capability catalog: merges model-availability gossip from peers into an expiring index,
//! picks the best provider for a download, and tracks provider reliability.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Entry lifetime when a gossip message does not carry `ttl_seconds`.
pub const DEFAULT_ENTRY_TTL_SECS: u64 = 300;

/// Latency assumed for providers that were never measured.
pub const MISSING_LATENCY_PENALTY_MS: f64 = 10_000.0;

/// Reliability given to a provider on first sighting.
pub const INITIAL_RELIABILITY: f64 = 1.0;

// Keeps the latency/reliability ratio finite.
const MIN_RELIABILITY_DIVISOR: f64 = 0.01;

/// Model description as advertised in gossip. Unknown keys are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub model_type: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ModelInfo {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            name: String::new(),
            model_type: String::new(),
            format: String::new(),
            size_bytes: 0,
            sha256: String::new(),
            capabilities: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEndpoints {
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub websocket: Option<String>,
}

/// Body of a `model_catalog` gossip message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogGossip {
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    pub timestamp: u64,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub transfer_endpoints: TransferEndpoints,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Gossip messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    ModelCatalog(CatalogGossip),
}

/// One peer offering one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerModelInfo {
    pub peer_id: String,
    pub node_name: String,
    pub http_endpoint: Option<String>,
    pub websocket: bool,
    pub latency_ms: Option<f64>,
    pub reliability: f64,
    pub last_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub model: ModelInfo,
    pub ttl_secs: u64,
    pub providers: Vec<PeerModelInfo>,
}

impl CatalogEntry {
    pub fn provider(&self, peer_id: &str) -> Option<&PeerModelInfo> {
        self.providers.iter().find(|p| p.peer_id == peer_id)
    }
}

/// Exponential moving average of transfer outcomes, clamped to [0, 1].
pub fn ema_reliability(old: f64, success: bool) -> f64 {
    let next = if success { 0.9 * old + 0.1 } else { 0.9 * old };
    next.clamp(0.0, 1.0)
}

/// Lower is better.
pub fn selection_score(p: &PeerModelInfo) -> f64 {
    let latency = p.latency_ms.unwrap_or(MISSING_LATENCY_PENALTY_MS);
    latency / p.reliability.max(MIN_RELIABILITY_DIVISOR)
}

/// HTTP-capable providers first; then lowest `latency / reliability`, ties by peer id.
pub fn select_best(providers: &[PeerModelInfo]) -> Option<&PeerModelInfo> {
    let http: Vec<&PeerModelInfo> = providers
        .iter()
        .filter(|p| p.http_endpoint.is_some())
        .collect();
    let pool: Vec<&PeerModelInfo> = if http.is_empty() {
        providers.iter().collect()
    } else {
        http
    };
    pool.into_iter().min_by(|a, b| {
        selection_score(a)
            .total_cmp(&selection_score(b))
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    })
}

/// Replace an unspecified host (`0.0.0.0`, `[::]`, empty) in an advertised endpoint with
/// the address the gossip actually came from.
pub fn resolve_endpoint(endpoint: &str, source: IpAddr) -> String {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return endpoint.to_string();
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let (host, port) = match authority.rfind(':') {
        Some(i) if !authority[i..].contains(']') => (&authority[..i], &authority[i..]),
        _ => (authority, ""),
    };
    if !matches!(host, "" | "0.0.0.0" | "[::]") {
        return endpoint.to_string();
    }
    let host = match source {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    format!("{scheme}://{host}{port}{path}")
}

/// Expiring index of which peers offer which models.
pub struct CapabilityCatalog {
    local_peer: String,
    default_ttl_secs: u64,
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
    latencies: RwLock<HashMap<String, f64>>,
}

impl CapabilityCatalog {
    pub fn new(local_peer: impl Into<String>, default_ttl_secs: u64) -> Self {
        Self {
            local_peer: local_peer.into(),
            default_ttl_secs,
            entries: RwLock::new(BTreeMap::new()),
            latencies: RwLock::new(HashMap::new()),
        }
    }

    /// Merge one gossip message received at `now`. Returns how many models it carried,
    /// 0 when the message is our own.
    pub fn apply_gossip(&self, gossip: &CatalogGossip, now: u64) -> usize {
        if gossip.node_id == self.local_peer {
            return 0;
        }
        let ttl = gossip.ttl_seconds.unwrap_or(self.default_ttl_secs);
        let latency = self.read_latencies().get(&gossip.node_id).copied();
        let mut entries = self.write_entries();
        for model in &gossip.models {
            if model.model_id.is_empty() {
                continue;
            }
            match entries.get_mut(&model.model_id) {
                None => {
                    debug!(model_id = %model.model_id, peer_id = %gossip.node_id, "new model in catalog");
                    entries.insert(
                        model.model_id.clone(),
                        CatalogEntry {
                            model: model.clone(),
                            ttl_secs: ttl,
                            providers: vec![new_provider(gossip, latency, now)],
                        },
                    );
                }
                Some(entry) => {
                    entry.ttl_secs = ttl;
                    if !model.sha256.eq_ignore_ascii_case(&entry.model.sha256) {
                        debug!(
                            model_id = %model.model_id,
                            peer_id = %gossip.node_id,
                            listed = %entry.model.sha256,
                            advertised = %model.sha256,
                            "provider disagrees on model hash, keeping the first"
                        );
                    }
                    match entry
                        .providers
                        .iter_mut()
                        .find(|p| p.peer_id == gossip.node_id)
                    {
                        Some(p) => {
                            p.last_seen = now;
                            p.node_name = gossip.node_name.clone();
                            p.http_endpoint = gossip.transfer_endpoints.http.clone();
                            p.websocket = gossip.transfer_endpoints.websocket.is_some();
                        }
                        None => entry.providers.push(new_provider(gossip, latency, now)),
                    }
                }
            }
        }
        gossip.models.len()
    }

    /// Record a measured round trip to `peer_id` on every entry it provides.
    pub fn record_latency(&self, peer_id: &str, latency_ms: f64) {
        self.write_latencies().insert(peer_id.to_string(), latency_ms);
        for entry in self.write_entries().values_mut() {
            for p in entry.providers.iter_mut().filter(|p| p.peer_id == peer_id) {
                p.latency_ms = Some(latency_ms);
            }
        }
    }

    /// Reliability update after a transfer. Returns the new reliability, or `None` if the
    /// provider is no longer listed.
    pub fn record_transfer_result(&self, model_id: &str, peer_id: &str, success: bool) -> Option<f64> {
        let mut entries = self.write_entries();
        let provider = entries
            .get_mut(model_id)?
            .providers
            .iter_mut()
            .find(|p| p.peer_id == peer_id)?;
        provider.reliability = ema_reliability(provider.reliability, success);
        debug!(model_id, peer_id, success, reliability = provider.reliability, "reliability updated");
        Some(provider.reliability)
    }

    /// Best provider for `model_id`. A listed `preferred` peer wins outright.
    pub fn best_peer(&self, model_id: &str, preferred: Option<&str>) -> Option<PeerModelInfo> {
        let entries = self.read_entries();
        let entry = entries.get(model_id)?;
        if let Some(p) = preferred.and_then(|id| entry.provider(id)) {
            return Some(p.clone());
        }
        select_best(&entry.providers).cloned()
    }

    /// Drop providers not seen within their entry's TTL, then entries left without providers.
    /// Returns the number of entries removed.
    pub fn prune_expired(&self, now: u64) -> usize {
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|model_id, entry| {
            let ttl = entry.ttl_secs;
            entry.providers.retain(|p| {
                let fresh = now.saturating_sub(p.last_seen) <= ttl;
                if !fresh {
                    debug!(model_id = %model_id, peer_id = %p.peer_id, "provider expired");
                }
                fresh
            });
            !entry.providers.is_empty()
        });
        before - entries.len()
    }

    /// Forget everything `peer_id` advertised, dropping entries it was the last provider of.
    /// Returns the number of entries removed.
    pub fn remove_provider(&self, peer_id: &str) -> usize {
        self.write_latencies().remove(peer_id);
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.providers.retain(|p| p.peer_id != peer_id);
            !entry.providers.is_empty()
        });
        before - entries.len()
    }

    pub fn entry(&self, model_id: &str) -> Option<CatalogEntry> {
        self.read_entries().get(model_id).cloned()
    }

    /// All entries ordered by model id.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.read_entries().values().cloned().collect()
    }

    pub fn models_with_capability(&self, capability: &str) -> Vec<CatalogEntry> {
        self.read_entries()
            .values()
            .filter(|e| e.model.capabilities.iter().any(|c| c == capability))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, BTreeMap<String, CatalogEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, BTreeMap<String, CatalogEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_latencies(&self) -> RwLockReadGuard<'_, HashMap<String, f64>> {
        self.latencies.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_latencies(&self) -> RwLockWriteGuard<'_, HashMap<String, f64>> {
        self.latencies.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_provider(gossip: &CatalogGossip, latency_ms: Option<f64>, now: u64) -> PeerModelInfo {
    PeerModelInfo {
        peer_id: gossip.node_id.clone(),
        node_name: gossip.node_name.clone(),
        http_endpoint: gossip.transfer_endpoints.http.clone(),
        websocket: gossip.transfer_endpoints.websocket.is_some(),
        latency_ms,
        reliability: INITIAL_RELIABILITY,
        last_seen: now,
    }
}
