//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

/// Daemon configuration. File: ~/.config/meshsync/config.toml or /etc/meshsync/config.toml.
/// Env overrides: MESHSYNC_PEER_ID, MESHSYNC_NODE_NAME, MESHSYNC_APP_ID, MESHSYNC_MESH_ID,
/// MESHSYNC_SHARED_SECRET, MESHSYNC_DISCOVERY_PORT, MESHSYNC_SYNC_PORT, MESHSYNC_HTTP_PORT,
/// MESHSYNC_MODELS_DIR.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's identity in the mesh (default: random UUID per start).
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    /// Human-readable name carried in catalog gossip.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Application id; peers with a different one are ignored.
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Mesh id; checked during the handshake.
    #[serde(default = "default_mesh_id")]
    pub mesh_id: String,
    /// Shared secret for handshake HMAC. Required.
    #[serde(default)]
    pub shared_secret: Option<String>,
    /// Discovery and catalog gossip UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Sync session TCP port (default 45679).
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,
    /// Model server HTTP port (default 45680).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Address all listeners bind to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Destination of discovery and gossip datagrams.
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: IpAddr,
    /// Where downloaded and shared models live.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_catalog_interval")]
    pub catalog_interval_secs: u64,
    /// Catalog entry lifetime when gossip does not carry one.
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,
    /// Serve local models to peers over HTTP.
    #[serde(default = "default_true")]
    pub serve_models: bool,
    /// Peers tracked at once; sightings of new peers beyond this are ignored.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

fn default_peer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "mesh-node".to_string())
}
fn default_app_id() -> String {
    "meshsync".to_string()
}
fn default_mesh_id() -> String {
    "default".to_string()
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_sync_port() -> u16 {
    45679
}
fn default_http_port() -> u16 {
    45680
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_broadcast_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}
fn default_models_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(data).join("meshsync/models");
    }
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/meshsync/models"),
        None => PathBuf::from("models"),
    }
}
fn default_discovery_interval() -> u64 {
    5
}
fn default_resync_interval() -> u64 {
    3
}
fn default_catalog_interval() -> u64 {
    30
}
fn default_catalog_ttl() -> u64 {
    mesh_core::catalog::DEFAULT_ENTRY_TTL_SECS
}
fn default_true() -> bool {
    true
}
fn default_max_peers() -> usize {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            node_name: default_node_name(),
            app_id: default_app_id(),
            mesh_id: default_mesh_id(),
            shared_secret: None,
            discovery_port: default_discovery_port(),
            sync_port: default_sync_port(),
            http_port: default_http_port(),
            bind_addr: default_bind_addr(),
            broadcast_addr: default_broadcast_addr(),
            models_dir: default_models_dir(),
            discovery_interval_secs: default_discovery_interval(),
            resync_interval_secs: default_resync_interval(),
            catalog_interval_secs: default_catalog_interval(),
            catalog_ttl_secs: default_catalog_ttl(),
            serve_models: true,
            max_peers: default_max_peers(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("peer_id", &self.peer_id)
            .field("node_name", &self.node_name)
            .field("app_id", &self.app_id)
            .field("mesh_id", &self.mesh_id)
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("discovery_port", &self.discovery_port)
            .field("sync_port", &self.sync_port)
            .field("http_port", &self.http_port)
            .field("bind_addr", &self.bind_addr)
            .field("broadcast_addr", &self.broadcast_addr)
            .field("models_dir", &self.models_dir)
            .finish_non_exhaustive()
    }
}

/// Config that cannot start a node.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("shared_secret is required")]
    MissingSecret,
    #[error("{0} must be non-empty")]
    Empty(&'static str),
    #[error("{0} must be at least 1 second")]
    ZeroInterval(&'static str),
    #[error("max_peers must be at least 1")]
    ZeroMaxPeers,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shared_secret.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingSecret);
        }
        for (name, v) in [
            ("peer_id", &self.peer_id),
            ("app_id", &self.app_id),
            ("mesh_id", &self.mesh_id),
        ] {
            if v.is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }
        for (name, v) in [
            ("discovery_interval_secs", self.discovery_interval_secs),
            ("resync_interval_secs", self.resync_interval_secs),
            ("catalog_interval_secs", self.catalog_interval_secs),
        ] {
            if v == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.max_peers == 0 {
            return Err(ConfigError::ZeroMaxPeers);
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn catalog_interval(&self) -> Duration {
        Duration::from_secs(self.catalog_interval_secs)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str, slot: &mut String| {
            if let Some(v) = lookup(key).filter(|v| !v.is_empty()) {
                *slot = v;
            }
        };
        text("MESHSYNC_PEER_ID", &mut self.peer_id);
        text("MESHSYNC_NODE_NAME", &mut self.node_name);
        text("MESHSYNC_APP_ID", &mut self.app_id);
        text("MESHSYNC_MESH_ID", &mut self.mesh_id);
        if let Some(s) = lookup("MESHSYNC_SHARED_SECRET").filter(|v| !v.is_empty()) {
            self.shared_secret = Some(s);
        }
        if let Some(s) = lookup("MESHSYNC_MODELS_DIR").filter(|v| !v.is_empty()) {
            self.models_dir = PathBuf::from(s);
        }
        let port = |key: &str, slot: &mut u16| {
            if let Some(s) = lookup(key) {
                match s.parse::<u16>() {
                    Ok(p) => *slot = p,
                    Err(_) => warn!(key, value = %s, "ignoring invalid port override"),
                }
            }
        };
        port("MESHSYNC_DISCOVERY_PORT", &mut self.discovery_port);
        port("MESHSYNC_SYNC_PORT", &mut self.sync_port);
        port("MESHSYNC_HTTP_PORT", &mut self.http_port);
    }
}

/// Load config: explicit file if given, else the first default path that exists, else defaults;
/// then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => {
                debug!("no config file found, using defaults");
                Config::default()
            }
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshsync/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshsync/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    debug!(path = %path.display(), "loaded config file");
    Ok(c)
}
