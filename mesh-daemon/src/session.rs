//! Sync sessions over TCP: authenticated hello, then both sides push every document and
//! drain the other's push until `sync_done`.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use mesh_core::wire::{decode_payload, frame_len, LEN_SIZE};
use mesh_core::{
    encode_frame, unix_now, AuthError, CapabilityCatalog, DocumentStore, FrameDecodeError,
    FrameEncodeError, MeshCredentials, Message, PeerTable, Sighting,
};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::PeerCandidate;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Limit for any single frame read or write.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);
const RESYNC_JITTER_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("timed out")]
    Timeout,
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("cannot encode frame: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("handshake rejected: {0}")]
    Auth(#[from] AuthError),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("a session with {0} is already running")]
    Busy(String),
    #[error("peer table is full")]
    PeerLimit,
}

/// Outcome of one completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub peer_id: String,
    pub sent: usize,
    pub received: usize,
    /// Received diffs that changed local state.
    pub changed: usize,
}

/// Peers with a session attempt currently running.
#[derive(Clone, Default)]
pub struct InFlight(Arc<Mutex<HashSet<String>>>);

/// Releases the peer's in-flight slot on drop.
pub struct InFlightGuard {
    set: InFlight,
    peer_id: String,
}

impl InFlight {
    pub fn try_claim(&self, peer_id: &str) -> Option<InFlightGuard> {
        let fresh = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.to_string());
        fresh.then(|| InFlightGuard {
            set: self.clone(),
            peer_id: peer_id.to_string(),
        })
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer_id)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer_id);
    }
}

/// Shared state every session task needs.
#[derive(Clone)]
pub struct SessionContext {
    pub credentials: Arc<MeshCredentials>,
    pub store: Arc<DocumentStore>,
    pub peers: Arc<PeerTable>,
    pub catalog: Arc<CapabilityCatalog>,
    /// Sync port assumed for peers that reach us before we have seen their announcement.
    pub default_sync_port: u16,
    pub in_flight: InFlight,
}

async fn timed<T>(fut: impl Future<Output = io::Result<T>>) -> Result<T, SessionError> {
    tokio::time::timeout(IO_TIMEOUT, fut)
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(SessionError::from)
}

/// Read one length-prefixed frame. Oversized lengths fail before any payload is read.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, SessionError> {
    let mut header = [0u8; LEN_SIZE];
    timed(reader.read_exact(&mut header)).await?;
    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    timed(reader.read_exact(&mut payload)).await?;
    Ok(decode_payload(&payload)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<(), SessionError> {
    let frame = encode_frame(msg)?;
    timed(writer.write_all(&frame)).await?;
    Ok(())
}

/// Acceptor handshake. On any failure nothing is sent back; the caller drops the connection.
pub async fn handshake_accept<S>(stream: &mut S, creds: &MeshCredentials) -> Result<String, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = read_frame(stream).await?;
    let peer_id = creds.verify_hello(&hello, unix_now())?;
    if peer_id == creds.peer_id() {
        return Err(SessionError::SelfConnection);
    }
    write_frame(stream, &creds.hello_ack()).await?;
    timed(stream.flush()).await?;
    Ok(peer_id)
}

/// Initiator handshake. Returns the acceptor's peer id and the hello round trip in ms.
pub async fn handshake_connect<S>(stream: &mut S, creds: &MeshCredentials) -> Result<(String, f64), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    write_frame(stream, &creds.hello(unix_now())?).await?;
    timed(stream.flush()).await?;
    let ack = read_frame(stream).await?;
    let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
    let peer_id = creds.verify_ack(&ack)?;
    if peer_id == creds.peer_id() {
        return Err(SessionError::SelfConnection);
    }
    Ok((peer_id, rtt_ms))
}

/// Push a snapshot of every document while draining the peer's push. Reading and writing run
/// concurrently so neither side can stall on a full socket buffer.
async fn exchange(stream: TcpStream, peer_id: &str, ctx: &SessionContext) -> Result<SyncReport, SessionError> {
    let (mut reader, mut writer) = stream.into_split();
    let docs = ctx.store.snapshot();

    let push = async {
        let mut sent = 0usize;
        for doc in &docs {
            match write_frame(&mut writer, &Message::sync_diff(doc)).await {
                Ok(()) => sent += 1,
                // nothing was written; the peer never sees this document
                Err(SessionError::Encode(FrameEncodeError::TooLarge)) => {
                    warn!(peer_id, collection = %doc.collection, doc_id = %doc.doc_id, "document exceeds frame limit, not sent")
                }
                Err(e) => return Err(e),
            }
        }
        write_frame(&mut writer, &Message::SyncDone).await?;
        timed(writer.flush()).await?;
        Ok::<usize, SessionError>(sent)
    };

    let drain = async {
        let (mut received, mut changed) = (0usize, 0usize);
        loop {
            let msg = match read_frame(&mut reader).await {
                Ok(m) => m,
                Err(SessionError::Frame(FrameDecodeError::Decode(e))) => {
                    warn!(peer_id, error = %e, "skipping malformed frame");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match msg {
                Message::SyncDone => break,
                m @ Message::SyncDiff { .. } => {
                    received += 1;
                    let Some(doc) = m.into_document() else { continue };
                    match ctx.store.apply_remote(&doc, peer_id) {
                        Ok(outcome) if outcome.changed() => changed += 1,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(peer_id, collection = %doc.collection, doc_id = %doc.doc_id, error = %e, "rejected remote document")
                        }
                    }
                }
                other => return Err(SessionError::Unexpected(other.kind())),
            }
        }
        Ok::<(usize, usize), SessionError>((received, changed))
    };

    let (sent, (received, changed)) = tokio::try_join!(push, drain)?;
    Ok(SyncReport {
        peer_id: peer_id.to_string(),
        sent,
        received,
        changed,
    })
}

/// Serve one inbound connection to completion. The session holds the peer's in-flight slot so
/// our own re-sync does not dial the same peer meanwhile.
pub async fn handle_inbound(
    mut stream: TcpStream,
    remote: SocketAddr,
    ctx: &SessionContext,
) -> Result<SyncReport, SessionError> {
    let peer_id = handshake_accept(&mut stream, &ctx.credentials).await?;
    let _guard = match ctx.in_flight.try_claim(&peer_id) {
        Some(guard) => Some(guard),
        // Both sides dialled at once: the session started by the lower peer id goes ahead.
        None if ctx.credentials.peer_id() < peer_id.as_str() => {
            return Err(SessionError::Busy(peer_id));
        }
        None => None,
    };
    let addr = ctx
        .peers
        .get(&peer_id)
        .map(|p| p.addr)
        .unwrap_or_else(|| SocketAddr::new(remote.ip(), ctx.default_sync_port));
    if ctx.peers.record_handshake(&peer_id, addr, None, unix_now()) == Sighting::Full {
        return Err(SessionError::PeerLimit);
    }
    exchange(stream, &peer_id, ctx).await
}

/// Dial `addr`, authenticate and run one session.
pub async fn sync_with(ctx: &SessionContext, addr: SocketAddr) -> Result<SyncReport, SessionError> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| SessionError::Timeout)??;
    let (peer_id, rtt_ms) = handshake_connect(&mut stream, &ctx.credentials).await?;
    if ctx.peers.record_handshake(&peer_id, addr, Some(rtt_ms), unix_now()) == Sighting::Full {
        return Err(SessionError::PeerLimit);
    }
    ctx.catalog.record_latency(&peer_id, rtt_ms);
    debug!(peer_id = %peer_id, %addr, rtt_ms, "handshake complete");
    exchange(stream, &peer_id, ctx).await
}

fn log_report(report: &SyncReport, addr: SocketAddr) {
    if report.changed > 0 {
        info!(
            peer_id = %report.peer_id, %addr,
            sent = report.sent, received = report.received, changed = report.changed,
            "sync applied remote changes"
        );
    } else {
        debug!(peer_id = %report.peer_id, %addr, sent = report.sent, received = report.received, "sync complete");
    }
}

/// Accept connections until cancelled; each runs in its own task.
pub async fn accept_loop(listener: TcpListener, ctx: SessionContext, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, remote)) => {
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        r = handle_inbound(stream, remote, &ctx) => match r {
                            Ok(report) => log_report(&report, remote),
                            Err(e) => debug!(%remote, error = %e, "inbound session dropped"),
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("sync listener stopped");
}

/// Start a background session with `peer_id` unless one is already running.
pub fn spawn_sync(ctx: &SessionContext, peer_id: &str, addr: SocketAddr, cancel: &CancellationToken) {
    let Some(guard) = ctx.in_flight.try_claim(peer_id) else {
        debug!(peer_id, "sync already in flight");
        return;
    };
    let ctx = ctx.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let _guard = guard;
        tokio::select! {
            _ = cancel.cancelled() => {}
            r = sync_with(&ctx, addr) => match r {
                Ok(report) => log_report(&report, addr),
                Err(e) => debug!(%addr, error = %e, "outbound session failed"),
            }
        }
    });
}

/// Connect to peers as discovery reports them.
pub async fn connect_loop(
    ctx: SessionContext,
    mut candidates: UnboundedReceiver<PeerCandidate>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            c = candidates.recv() => c,
        };
        let Some(c) = next else { break };
        spawn_sync(&ctx, &c.peer_id, c.addr, &cancel);
    }
}

/// Periodically re-sync with every known peer so that new local writes propagate.
pub async fn resync_loop(ctx: SessionContext, interval: Duration, cancel: CancellationToken) {
    loop {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=RESYNC_JITTER_MS));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval + jitter) => {}
        }
        for peer in ctx.peers.all() {
            spawn_sync(&ctx, &peer.peer_id, peer.addr, &cancel);
        }
    }
    debug!("resync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{Document, Fields, Value, VersionVector, MAX_CLOCK_SKEW_SECS, MAX_FRAME_LEN};

    fn ctx(peer: &str, secret: &str) -> SessionContext {
        SessionContext {
            credentials: Arc::new(MeshCredentials::new(peer, "app", "mesh", secret)),
            store: Arc::new(DocumentStore::new(peer)),
            peers: Arc::new(PeerTable::new()),
            catalog: Arc::new(CapabilityCatalog::new(peer, 300)),
            default_sync_port: 45679,
            in_flight: InFlight::default(),
        }
    }

    fn fields(k: &str, v: &str) -> Fields {
        [(k.to_string(), Value::from(v))].into_iter().collect()
    }

    async fn serve(ctx: &SessionContext) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, ctx.clone(), cancel.clone()));
        (addr, cancel)
    }

    #[tokio::test]
    async fn one_session_converges_both_sides() {
        let a = ctx("aaaa", "s3cret");
        let b = ctx("bbbb", "s3cret");
        let id_a = a.store.insert("notes", fields("title", "from a")).unwrap();
        let id_b = b.store.insert("notes", fields("title", "from b")).unwrap();
        let (addr, cancel) = serve(&b).await;

        let report = sync_with(&a, addr).await.unwrap();
        assert_eq!(report.peer_id, "bbbb");
        assert_eq!((report.sent, report.received, report.changed), (1, 1, 1));

        // the acceptor applies after the initiator returns; poll briefly
        for _ in 0..50 {
            if b.store.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.store.len(), 2);
        assert_eq!(b.store.len(), 2);
        assert_eq!(a.store.get("notes", &id_b), b.store.get("notes", &id_b));
        assert_eq!(a.store.get("notes", &id_a), b.store.get("notes", &id_a));
        assert!(a.peers.get("bbbb").unwrap().latency_ms.is_some());
        assert!(b.peers.get("aaaa").is_some());

        // a second pass changes nothing
        let again = sync_with(&a, addr).await.unwrap();
        assert_eq!(again.changed, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn wrong_secret_exchanges_nothing() {
        let a = ctx("aaaa", "s3cret");
        let b = ctx("bbbb", "other");
        a.store.insert("notes", fields("title", "private")).unwrap();
        let (addr, cancel) = serve(&b).await;

        assert!(sync_with(&a, addr).await.is_err());
        assert!(b.store.is_empty());
        assert!(b.peers.is_empty());
        assert!(a.peers.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn self_connection_is_refused() {
        let a = ctx("aaaa", "s3cret");
        let (addr, cancel) = serve(&a).await;
        assert!(sync_with(&a, addr).await.is_err());
        assert!(a.peers.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, SessionError::Frame(FrameDecodeError::TooLarge)));
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &Message::SyncDone).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), Message::SyncDone);
    }

    #[tokio::test]
    async fn acceptor_sends_nothing_on_bad_hello() {
        let b = ctx("bbbb", "s3cret");
        let (addr, cancel) = serve(&b).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &Message::SyncDone).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        cancel.cancel();
    }

    async fn reply_len(stream: &mut TcpStream) -> usize {
        let mut buf = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn skewed_hello_exchanges_nothing() {
        let a = ctx("aaaa", "s3cret");
        let b = ctx("bbbb", "s3cret");
        let (addr, cancel) = serve(&b).await;
        let doc = a.store.get("notes", &a.store.insert("notes", fields("k", "v")).unwrap()).unwrap();

        let stale = a.credentials.hello(unix_now() - MAX_CLOCK_SKEW_SECS - 700).unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &stale).await.unwrap();
        let _ = write_frame(&mut stream, &Message::sync_diff(&doc)).await;
        let _ = write_frame(&mut stream, &Message::SyncDone).await;
        assert_eq!(reply_len(&mut stream).await, 0);
        assert!(b.store.is_empty());
        assert!(b.peers.is_empty());

        // the same peer with a current clock gets through
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &a.credentials.hello(unix_now()).unwrap()).await.unwrap();
        assert!(matches!(read_frame(&mut stream).await.unwrap(), Message::HelloAck { .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn oversized_document_does_not_block_the_rest() {
        let a = ctx("aaaa", "s3cret");
        let b = ctx("bbbb", "s3cret");
        let mut big = Document::empty("blobs", "huge");
        big.fields = fields("data", &"x".repeat(MAX_FRAME_LEN as usize));
        big.version = VersionVector::from([("cccc", 1)]);
        a.store.apply_remote(&big, "cccc").unwrap();
        let small = a.store.insert("notes", fields("title", "small")).unwrap();
        let (addr, cancel) = serve(&b).await;

        let report = sync_with(&a, addr).await.unwrap();
        assert_eq!(report.sent, 1);
        for _ in 0..50 {
            if b.store.get("notes", &small).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(b.store.get("notes", &small).is_some());
        assert!(b.store.get("blobs", "huge").is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn simultaneous_dials_keep_the_lower_initiator() {
        let a = ctx("aaaa", "s3cret");
        let b = ctx("bbbb", "s3cret");
        let (addr_a, cancel_a) = serve(&a).await;
        let (addr_b, cancel_b) = serve(&b).await;
        let id_a = a.store.insert("notes", fields("from", "a")).unwrap();
        b.store.insert("notes", fields("from", "b")).unwrap();

        // a is already dialling b, so b's session into a is turned away
        let a_outbound = a.in_flight.try_claim("bbbb").unwrap();
        assert!(sync_with(&b, addr_a).await.is_err());
        assert_eq!(a.store.len(), 1);

        // b is already dialling a, yet a's session still goes ahead
        let b_outbound = b.in_flight.try_claim("aaaa").unwrap();
        let report = sync_with(&a, addr_b).await.unwrap();
        assert_eq!(report.changed, 1);
        for _ in 0..50 {
            if b.store.get("notes", &id_a).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(b.store.get("notes", &id_a).is_some());

        drop((a_outbound, b_outbound));
        cancel_a.cancel();
        cancel_b.cancel();
    }

    #[tokio::test]
    async fn full_peer_table_refuses_unknown_initiator() {
        let a = ctx("aaaa", "s3cret");
        let mut b = ctx("bbbb", "s3cret");
        b.peers = Arc::new(PeerTable::with_max_peers(1));
        b.peers.observe("cccc", "10.0.0.3:45679".parse().unwrap(), unix_now());
        a.store.insert("notes", fields("k", "v")).unwrap();
        let (addr, cancel) = serve(&b).await;

        assert!(sync_with(&a, addr).await.is_err());
        assert!(b.store.is_empty());
        assert!(b.peers.get("aaaa").is_none());
        cancel.cancel();
    }

    #[test]
    fn in_flight_claim_is_exclusive_until_dropped() {
        let set = InFlight::default();
        let guard = set.try_claim("aaaa").unwrap();
        assert!(set.try_claim("aaaa").is_none());
        assert!(set.contains("aaaa"));
        drop(guard);
        assert!(set.try_claim("aaaa").is_some());
    }
}
