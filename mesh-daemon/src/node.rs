//! MeshNode: owns the store, peer table, catalog and transfers, and runs every background loop
//! under one cancellation token.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use mesh_core::{
    Announcement, CapabilityCatalog, Document, DocumentStore, Fields, MeshCredentials, ModelInfo,
    ModelSidecar, PeerRecord, PeerTable, StoreError, Subscription, SubscriptionId, TransferState,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, ConfigError};
use crate::discovery::{self, GossipSettings, ListenContext};
use crate::download::TransferCoordinator;
use crate::library::{LibraryError, ModelLibrary};
use crate::serve;
use crate::session::{self, InFlight, SessionContext, SessionError, SyncReport};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot bind {what}: {source}")]
    Bind {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

fn bind_err(what: &'static str) -> impl FnOnce(std::io::Error) -> NodeError {
    move |source| NodeError::Bind { what, source }
}

pub struct MeshNode {
    peer_id: String,
    store: Arc<DocumentStore>,
    peers: Arc<PeerTable>,
    catalog: Arc<CapabilityCatalog>,
    library: Arc<ModelLibrary>,
    transfers: Arc<TransferCoordinator>,
    sessions: SessionContext,
    sync_addr: SocketAddr,
    discovery_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshNode {
    /// Validate `config`, bind every socket and spawn the background loops.
    pub async fn start(config: Config) -> Result<Self, NodeError> {
        config.validate()?;
        let secret = config.shared_secret.clone().unwrap_or_default();
        let credentials = Arc::new(MeshCredentials::new(
            config.peer_id.clone(),
            config.app_id.clone(),
            config.mesh_id.clone(),
            secret,
        ));
        let store = Arc::new(DocumentStore::new(config.peer_id.clone()));
        let peers = Arc::new(PeerTable::with_max_peers(config.max_peers));
        let catalog = Arc::new(CapabilityCatalog::new(
            config.peer_id.clone(),
            config.catalog_ttl_secs,
        ));
        let library = Arc::new(ModelLibrary::new(config.models_dir.clone()));
        let cancel = CancellationToken::new();
        let transfers = Arc::new(TransferCoordinator::new(
            catalog.clone(),
            library.clone(),
            cancel.clone(),
            tokio::runtime::Handle::current(),
        )?);

        let sync_listener = TcpListener::bind((config.bind_addr, config.sync_port))
            .await
            .map_err(bind_err("sync listener"))?;
        let sync_addr = sync_listener.local_addr().map_err(bind_err("sync listener"))?;
        let udp = Arc::new(
            discovery::bind_socket(config.bind_addr, config.discovery_port)
                .map_err(bind_err("discovery socket"))?,
        );
        let discovery_addr = udp.local_addr().map_err(bind_err("discovery socket"))?;
        let http_listener = if config.serve_models {
            Some(
                TcpListener::bind((config.bind_addr, config.http_port))
                    .await
                    .map_err(bind_err("model server"))?,
            )
        } else {
            None
        };
        let http_addr = match &http_listener {
            Some(l) => Some(l.local_addr().map_err(bind_err("model server"))?),
            None => None,
        };

        let sessions = SessionContext {
            credentials: credentials.clone(),
            store: store.clone(),
            peers: peers.clone(),
            catalog: catalog.clone(),
            default_sync_port: sync_addr.port(),
            in_flight: InFlight::default(),
        };
        let dest = SocketAddr::new(config.broadcast_addr, config.discovery_port);
        let (connect_tx, connect_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut tasks = vec![
            tokio::spawn(discovery::broadcast_loop(
                udp.clone(),
                Announcement {
                    peer_id: config.peer_id.clone(),
                    app_id: config.app_id.clone(),
                    tcp_port: sync_addr.port(),
                },
                dest,
                config.discovery_interval(),
                cancel.clone(),
            )),
            tokio::spawn(discovery::listen_loop(
                udp.clone(),
                ListenContext {
                    local_peer: config.peer_id.clone(),
                    app_id: config.app_id.clone(),
                    peers: peers.clone(),
                    catalog: catalog.clone(),
                    connect_tx,
                },
                cancel.clone(),
            )),
            tokio::spawn(discovery::gossip_loop(
                udp,
                GossipSettings {
                    local_peer: config.peer_id.clone(),
                    node_name: config.node_name.clone(),
                    http_port: http_addr.map(|a| a.port()),
                    ttl_secs: config.catalog_ttl_secs,
                    dest,
                    interval: config.catalog_interval(),
                },
                library.clone(),
                catalog.clone(),
                cancel.clone(),
            )),
            tokio::spawn(session::accept_loop(
                sync_listener,
                sessions.clone(),
                cancel.clone(),
            )),
            tokio::spawn(session::connect_loop(
                sessions.clone(),
                connect_rx,
                cancel.clone(),
            )),
            tokio::spawn(session::resync_loop(
                sessions.clone(),
                config.resync_interval(),
                cancel.clone(),
            )),
        ];
        if let Some(listener) = http_listener {
            tasks.push(tokio::spawn(serve::serve_loop(
                listener,
                library.clone(),
                cancel.clone(),
            )));
        }

        info!(
            peer_id = %config.peer_id, %sync_addr, %discovery_addr,
            http = ?http_addr, models_dir = %config.models_dir.display(),
            "mesh node started"
        );
        Ok(Self {
            peer_id: config.peer_id,
            store,
            peers,
            catalog,
            library,
            transfers,
            sessions,
            sync_addr,
            discovery_addr,
            http_addr,
            cancel,
            tasks,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn sync_addr(&self) -> SocketAddr {
        self.sync_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn insert(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        self.store.insert(collection, fields)
    }

    pub fn update(&self, collection: &str, doc_id: &str, fields: Fields) -> Result<(), StoreError> {
        self.store.update(collection, doc_id, fields)
    }

    pub fn query(&self, collection: &str) -> Vec<Document> {
        self.store.query(collection)
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> Option<Document> {
        self.store.get(collection, doc_id)
    }

    /// Change events for one collection, or all of them with `None`.
    pub fn observe(&self, collection: Option<&str>) -> Subscription {
        self.store.observe(collection)
    }

    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        self.store.remove_observer(id)
    }

    /// Every peer seen through discovery or a handshake, ordered by id.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        self.peers.all()
    }

    /// Drop `peer_id` from the peer table and its models from the catalog. The re-sync loop
    /// stops dialling it until discovery sees it again. Returns false for an unknown peer.
    pub fn forget_peer(&self, peer_id: &str) -> bool {
        let known = self.peers.remove(peer_id).is_some();
        let dropped = self.catalog.remove_provider(peer_id);
        if known {
            info!(peer_id, models_dropped = dropped, "forgot peer");
        }
        known
    }

    /// Run one session with the node listening at `addr` right now, outside the re-sync cadence.
    pub async fn sync_now(&self, addr: SocketAddr) -> Result<SyncReport, SessionError> {
        session::sync_with(&self.sessions, addr).await
    }

    pub fn download_model(&self, model_id: &str, preferred_peer: Option<&str>) -> Option<String> {
        self.transfers.start(model_id, preferred_peer)
    }

    pub fn cancel_download(&self, model_id: &str) -> bool {
        self.transfers.cancel(model_id)
    }

    pub fn download_states(&self) -> HashMap<String, TransferState> {
        self.transfers.states()
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    /// Models this node holds and advertises.
    pub fn local_models(&self) -> Vec<ModelSidecar> {
        self.library.list()
    }

    /// Copy a model file into the models directory so peers can fetch it.
    pub fn add_local_model(&self, source: &Path, model: ModelInfo) -> Result<ModelSidecar, LibraryError> {
        self.library.import(source, model)
    }

    /// Cancel every loop and transfer, then wait for the loops to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }
        info!(peer_id = %self.peer_id, "mesh node stopped");
    }
}
