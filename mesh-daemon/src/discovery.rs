//! LAN discovery and catalog gossip over one UDP socket: periodic broadcast, demuxed receive,
//! peer table upkeep.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::catalog::CatalogGossip;
use mesh_core::datagram::{accepts, decode_datagram, encode_announcement, encode_catalog};
use mesh_core::{
    unix_now, Announcement, CapabilityCatalog, Datagram, ModelInfo, PeerTable, Sighting,
    TransferEndpoints,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::library::ModelLibrary;

/// How long one receive waits before re-checking for shutdown.
const RECV_POLL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65_536;

/// A newly discovered peer the session layer should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub peer_id: String,
    pub addr: SocketAddr,
}

/// What the receive side needs to act on datagrams.
#[derive(Clone)]
pub struct ListenContext {
    pub local_peer: String,
    pub app_id: String,
    pub peers: Arc<PeerTable>,
    pub catalog: Arc<CapabilityCatalog>,
    pub connect_tx: UnboundedSender<PeerCandidate>,
}

/// Bind the shared discovery socket with broadcast enabled.
pub fn bind_socket(ip: IpAddr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((ip, port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Send our announcement to `dest` every `interval` until cancelled. Send errors are logged
/// and the loop keeps going.
pub async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    announcement: Announcement,
    dest: SocketAddr,
    interval: Duration,
    cancel: CancellationToken,
) {
    let frame = match encode_announcement(&announcement) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "cannot encode announcement, discovery broadcast disabled");
            return;
        }
    };
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(%dest, error = %e, "announcement send failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("discovery broadcast stopped");
}

/// Receive datagrams until cancelled; new peers are handed to `connect_tx`.
pub async fn listen_loop(socket: Arc<UdpSocket>, ctx: ListenContext, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let recv = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(RECV_POLL, socket.recv_from(&mut buf)) => r,
        };
        let (n, from) = match recv {
            Err(_) => continue,
            Ok(Err(e)) => {
                debug!(error = %e, "discovery recv failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Ok(Ok(v)) => v,
        };
        if let Some(candidate) = handle_datagram(&buf[..n], from, &ctx, unix_now()) {
            if ctx.connect_tx.send(candidate).is_err() {
                debug!("session layer gone, stopping discovery listener");
                break;
            }
        }
    }
    debug!("discovery listener stopped");
}

/// Act on one datagram. Returns a candidate only for the first sighting of a peer.
pub fn handle_datagram(
    bytes: &[u8],
    from: SocketAddr,
    ctx: &ListenContext,
    now: u64,
) -> Option<PeerCandidate> {
    let datagram = match decode_datagram(bytes) {
        Ok(d) => d,
        Err(e) => {
            debug!(%from, error = %e, "ignoring datagram");
            return None;
        }
    };
    match datagram {
        Datagram::Discovery(a) => {
            if !accepts(&a, &ctx.local_peer, &ctx.app_id) {
                return None;
            }
            let addr = SocketAddr::new(from.ip(), a.tcp_port);
            match ctx.peers.observe(&a.peer_id, addr, now) {
                Sighting::New => {
                    info!(peer_id = %a.peer_id, %addr, "discovered peer");
                    Some(PeerCandidate {
                        peer_id: a.peer_id,
                        addr,
                    })
                }
                Sighting::Known => None,
                Sighting::Full => {
                    debug!(peer_id = %a.peer_id, %addr, "peer table full, ignoring new peer");
                    None
                }
            }
        }
        Datagram::Catalog(mut g) => {
            if g.node_id == ctx.local_peer {
                return None;
            }
            if let Some(http) = g.transfer_endpoints.http.as_mut() {
                *http = mesh_core::catalog::resolve_endpoint(http, from.ip());
            }
            let n = ctx.catalog.apply_gossip(&g, now);
            debug!(peer_id = %g.node_id, models = n, "catalog gossip applied");
            None
        }
    }
}

/// Our catalog advertisement. `http_port` is the model server port, if serving.
pub fn local_gossip(
    local_peer: &str,
    node_name: &str,
    models: Vec<ModelInfo>,
    http_port: Option<u16>,
    ttl_secs: u64,
    now: u64,
) -> CatalogGossip {
    CatalogGossip {
        node_id: local_peer.to_string(),
        node_name: node_name.to_string(),
        timestamp: now,
        models,
        transfer_endpoints: TransferEndpoints {
            http: http_port.map(|p| format!("http://0.0.0.0:{p}")),
            websocket: None,
        },
        ttl_seconds: Some(ttl_secs),
    }
}

/// Settings for the gossip loop.
pub struct GossipSettings {
    pub local_peer: String,
    pub node_name: String,
    pub http_port: Option<u16>,
    pub ttl_secs: u64,
    pub dest: SocketAddr,
    pub interval: Duration,
}

/// Every `interval`: advertise local models, then drop expired catalog entries.
pub async fn gossip_loop(
    socket: Arc<UdpSocket>,
    settings: GossipSettings,
    library: Arc<ModelLibrary>,
    catalog: Arc<CapabilityCatalog>,
    cancel: CancellationToken,
) {
    loop {
        let models: Vec<ModelInfo> = library.list().into_iter().map(|s| s.model).collect();
        let now = unix_now();
        if !models.is_empty() {
            let gossip = local_gossip(
                &settings.local_peer,
                &settings.node_name,
                models,
                settings.http_port,
                settings.ttl_secs,
                now,
            );
            match encode_catalog(&gossip) {
                Ok(frame) => {
                    if let Err(e) = socket.send_to(&frame, settings.dest).await {
                        debug!(dest = %settings.dest, error = %e, "catalog gossip send failed");
                    }
                }
                Err(e) => warn!(error = %e, "cannot encode catalog gossip"),
            }
        }
        let pruned = catalog.prune_expired(now);
        if pruned > 0 {
            debug!(pruned, "expired catalog entries removed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
    debug!("catalog gossip stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn ctx() -> (ListenContext, mpsc::UnboundedReceiver<PeerCandidate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ListenContext {
                local_peer: "local".into(),
                app_id: "app".into(),
                peers: Arc::new(PeerTable::new()),
                catalog: Arc::new(CapabilityCatalog::new("local", 300)),
                connect_tx: tx,
            },
            rx,
        )
    }

    fn announce(peer: &str, app: &str) -> Vec<u8> {
        encode_announcement(&Announcement {
            peer_id: peer.into(),
            app_id: app.into(),
            tcp_port: 7000,
        })
        .unwrap()
    }

    #[test]
    fn first_sighting_yields_candidate_with_advertised_port() {
        let (ctx, _rx) = ctx();
        let from: SocketAddr = "10.0.0.9:40000".parse().unwrap();
        let c = handle_datagram(&announce("remote", "app"), from, &ctx, 10).unwrap();
        assert_eq!(c.addr, "10.0.0.9:7000".parse().unwrap());
        assert!(handle_datagram(&announce("remote", "app"), from, &ctx, 11).is_none());
        assert_eq!(ctx.peers.get("remote").unwrap().last_seen, 11);
    }

    #[test]
    fn foreign_app_self_and_garbage_are_ignored() {
        let (ctx, _rx) = ctx();
        let from: SocketAddr = "10.0.0.9:40000".parse().unwrap();
        assert!(handle_datagram(&announce("remote", "other"), from, &ctx, 1).is_none());
        assert!(handle_datagram(&announce("local", "app"), from, &ctx, 1).is_none());
        assert!(handle_datagram(b"MSH1{", from, &ctx, 1).is_none());
        assert!(handle_datagram(b"XX", from, &ctx, 1).is_none());
        assert!(ctx.peers.is_empty());
    }

    #[test]
    fn full_table_yields_no_candidate() {
        let (mut ctx, _rx) = ctx();
        ctx.peers = Arc::new(PeerTable::with_max_peers(1));
        let from: SocketAddr = "10.0.0.9:40000".parse().unwrap();
        assert!(handle_datagram(&announce("first", "app"), from, &ctx, 1).is_some());
        assert!(handle_datagram(&announce("second", "app"), from, &ctx, 1).is_none());
        assert!(ctx.peers.get("second").is_none());

        ctx.peers.remove("first");
        assert!(handle_datagram(&announce("second", "app"), from, &ctx, 2).is_some());
    }

    #[test]
    fn gossip_endpoint_is_rewritten_to_sender() {
        let (ctx, _rx) = ctx();
        let g = local_gossip("remote", "box", vec![ModelInfo::new("m1")], Some(8080), 60, 5);
        let bytes = encode_catalog(&g).unwrap();
        let from: SocketAddr = "192.168.1.20:45678".parse().unwrap();
        assert!(handle_datagram(&bytes, from, &ctx, 5).is_none());
        let entry = ctx.catalog.entry("m1").unwrap();
        assert_eq!(
            entry.providers[0].http_endpoint.as_deref(),
            Some("http://192.168.1.20:8080")
        );
        assert_eq!(entry.ttl_secs, 60);
    }

    #[tokio::test]
    async fn listener_forwards_new_peers() {
        let (ctx, mut rx) = ctx();
        let listener = Arc::new(bind_socket("127.0.0.1".parse().unwrap(), 0).unwrap());
        let dest = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen_loop(listener, ctx, cancel.clone()));

        let sender = Arc::new(bind_socket("127.0.0.1".parse().unwrap(), 0).unwrap());
        let ann = Announcement {
            peer_id: "remote".into(),
            app_id: "app".into(),
            tcp_port: 7001,
        };
        tokio::spawn(broadcast_loop(
            sender,
            ann,
            dest,
            Duration::from_millis(50),
            cancel.clone(),
        ));

        let c = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.peer_id, "remote");
        assert_eq!(c.addr, "127.0.0.1:7001".parse().unwrap());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
    }
}
