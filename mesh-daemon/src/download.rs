//! Transfer coordinator: resumable model downloads from the best catalog provider, verified
//! against the catalog's SHA-256 before they become visible.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use mesh_core::integrity::{digest_matches, hash_file};
use mesh_core::transfer::{is_safe_model_id, ProgressTracker};
use mesh_core::{unix_now, CapabilityCatalog, ModelInfo, ModelLayout, ModelSidecar, TransferState};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::library::ModelLibrary;
use crate::serve::DOWNLOAD_PREFIX;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest wait for response headers or the next body chunk before a provider counts as failed.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("provider sent nothing for {0:?}")]
    Stalled(Duration),
}

enum Fetched {
    Done,
    Cancelled,
}

#[derive(Default)]
struct Transfers {
    states: HashMap<String, TransferState>,
    tokens: HashMap<String, CancellationToken>,
}

pub struct TransferCoordinator {
    catalog: Arc<CapabilityCatalog>,
    library: Arc<ModelLibrary>,
    client: reqwest::Client,
    transfers: Mutex<Transfers>,
    root: CancellationToken,
    runtime: Handle,
    stall_timeout: Duration,
}

impl TransferCoordinator {
    /// Transfers run on `runtime` under child tokens of `root`.
    pub fn new(
        catalog: Arc<CapabilityCatalog>,
        library: Arc<ModelLibrary>,
        root: CancellationToken,
        runtime: Handle,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            catalog,
            library,
            client,
            transfers: Mutex::new(Transfers::default()),
            root,
            runtime,
            stall_timeout: STALL_TIMEOUT,
        })
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Start downloading `model_id` in the background. Returns a request id, or `None` when the
    /// id is unsafe, the model is unknown, already present, or already downloading.
    pub fn start(self: &Arc<Self>, model_id: &str, preferred: Option<&str>) -> Option<String> {
        if !is_safe_model_id(model_id) {
            warn!(model_id, "refusing download of unsafe model id");
            return None;
        }
        if self.library.is_present(model_id) {
            info!(model_id, "model already present locally");
            return None;
        }
        let token = {
            let mut t = self.lock();
            if t.states.get(model_id).is_some_and(TransferState::is_active) {
                debug!(model_id, "download already running");
                return None;
            }
            if self.catalog.entry(model_id).is_none() {
                t.states
                    .insert(model_id.to_string(), TransferState::failed("model not in catalog"));
                return None;
            }
            t.states.insert(model_id.to_string(), TransferState::Preparing);
            let token = self.root.child_token();
            t.tokens.insert(model_id.to_string(), token.clone());
            token
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let this = self.clone();
        let model_id = model_id.to_string();
        let preferred = preferred.map(str::to_string);
        self.runtime.spawn(async move {
            let state = this.run(&model_id, preferred.as_deref(), &token).await;
            let mut t = this.lock();
            t.tokens.remove(&model_id);
            t.states.insert(model_id, state);
        });
        Some(request_id)
    }

    /// Request cancellation of a running download. The partial file is kept.
    pub fn cancel(&self, model_id: &str) -> bool {
        match self.lock().tokens.get(model_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, model_id: &str) -> Option<TransferState> {
        self.lock().states.get(model_id).cloned()
    }

    pub fn states(&self) -> HashMap<String, TransferState> {
        self.lock().states.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Transfers> {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, model_id: &str, state: TransferState) {
        self.lock().states.insert(model_id.to_string(), state);
    }

    fn layout(&self) -> &ModelLayout {
        self.library.layout()
    }

    /// Whole pipeline for one model; returns the terminal state.
    async fn run(&self, model_id: &str, preferred: Option<&str>, cancel: &CancellationToken) -> TransferState {
        let Some(entry) = self.catalog.entry(model_id) else {
            return TransferState::failed("model not in catalog");
        };
        let model = entry.model;
        if model.sha256.trim().is_empty() {
            return TransferState::failed("catalog entry declares no sha256");
        }
        let Some(peer) = self.catalog.best_peer(model_id, preferred) else {
            return TransferState::failed("no provider for model");
        };
        let Some(endpoint) = peer.http_endpoint.as_deref() else {
            return TransferState::failed(format!("provider {} has no HTTP endpoint", peer.peer_id));
        };
        info!(model_id, peer_id = %peer.peer_id, endpoint, "downloading model");

        match self.fetch(endpoint, &model, cancel).await {
            Ok(Fetched::Done) => {}
            Ok(Fetched::Cancelled) => {
                info!(model_id, "download cancelled, partial file kept");
                return TransferState::Cancelled;
            }
            Err(e) => {
                warn!(model_id, peer_id = %peer.peer_id, error = %e, "download failed");
                self.catalog.record_transfer_result(model_id, &peer.peer_id, false);
                return TransferState::failed(format!("transfer from {} failed: {e}", peer.peer_id));
            }
        }

        self.set_state(model_id, TransferState::Verifying);
        let partial = self.layout().partial_path(model_id);
        let hashed = {
            let partial = partial.clone();
            tokio::task::spawn_blocking(move || hash_file(&partial)).await
        };
        let actual = match hashed {
            Ok(Ok(h)) => h,
            Ok(Err(e)) => return TransferState::failed(format!("cannot hash download: {e}")),
            Err(e) => return TransferState::failed(format!("hash task failed: {e}")),
        };
        if !digest_matches(&actual, &model.sha256) {
            warn!(model_id, expected = %model.sha256, actual = %actual, "hash mismatch, discarding download");
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                debug!(path = %partial.display(), error = %e, "cannot remove partial file");
            }
            self.catalog.record_transfer_result(model_id, &peer.peer_id, false);
            return TransferState::failed(format!(
                "hash mismatch: expected {}, got {actual}",
                model.sha256
            ));
        }

        match self.install(&model, &partial, &peer.peer_id).await {
            Ok(path) => {
                self.catalog.record_transfer_result(model_id, &peer.peer_id, true);
                info!(model_id, path = %path.display(), "model downloaded and verified");
                TransferState::Completed { path }
            }
            Err(e) => TransferState::failed(format!("cannot install model: {e}")),
        }
    }

    async fn install(&self, model: &ModelInfo, partial: &std::path::Path, source_peer: &str) -> anyhow::Result<PathBuf> {
        let path = self.layout().final_path(model);
        tokio::fs::rename(partial, &path).await?;
        self.library.write_sidecar(&ModelSidecar {
            model: model.clone(),
            file_name: ModelLayout::file_name(model),
            downloaded_at: unix_now(),
            source_peer: Some(source_peer.to_string()),
        })?;
        Ok(path)
    }

    /// Stream the model into its partial file, resuming from whatever is already there.
    async fn fetch(&self, endpoint: &str, model: &ModelInfo, cancel: &CancellationToken) -> Result<Fetched, FetchError> {
        tokio::fs::create_dir_all(self.layout().root()).await?;
        let partial = self.layout().partial_path(&model.model_id);
        let offset = tokio::fs::metadata(&partial).await.map(|m| m.len()).unwrap_or(0);

        let url = format!("{}{}{}", endpoint.trim_end_matches('/'), DOWNLOAD_PREFIX, model.model_id);
        let mut req = self.client.get(&url);
        if offset > 0 {
            debug!(model_id = %model.model_id, offset, "resuming download");
            req = req.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let stall = self.stall_timeout;
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Fetched::Cancelled),
            r = tokio::time::timeout(stall, req.send()) => r.map_err(|_| FetchError::Stalled(stall))??,
        };

        let status = resp.status();
        let (mut file, start) = if status == StatusCode::PARTIAL_CONTENT {
            let f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&partial)
                .await?;
            (f, offset)
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            debug!(model_id = %model.model_id, "partial file already complete");
            return Ok(Fetched::Done);
        } else if status.is_success() {
            if offset > 0 {
                debug!(model_id = %model.model_id, "range ignored, restarting from zero");
            }
            (tokio::fs::File::create(&partial).await?, 0)
        } else {
            return Err(FetchError::Status(status));
        };

        let total = resp
            .content_length()
            .map(|n| n + start)
            .or((model.size_bytes > 0).then_some(model.size_bytes));
        let mut tracker = ProgressTracker::new(start, total);
        let started = Instant::now();
        self.set_state(&model.model_id, TransferState::Downloading(tracker.snapshot(Duration::ZERO)));

        let mut body = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Ok(Fetched::Cancelled);
                }
                c = tokio::time::timeout(stall, body.next()) => match c {
                    Ok(c) => c,
                    Err(_) => {
                        file.flush().await?;
                        return Err(FetchError::Stalled(stall));
                    }
                },
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            tracker.record(chunk.len());
            if let Some(p) = tracker.poll(started.elapsed()) {
                self.set_state(&model.model_id, TransferState::Downloading(p));
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        self.set_state(
            &model.model_id,
            TransferState::Downloading(tracker.snapshot(started.elapsed())),
        );
        Ok(Fetched::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serve::serve_loop;
    use mesh_core::catalog::INITIAL_RELIABILITY;
    use mesh_core::integrity::sha256_hex;
    use mesh_core::{CatalogGossip, TransferEndpoints};
    use rand::RngCore;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    struct Fixture {
        _dir: tempfile::TempDir,
        content: Vec<u8>,
        consumer: Arc<TransferCoordinator>,
        catalog: Arc<CapabilityCatalog>,
        cancel: CancellationToken,
    }

    async fn provider(dir: &std::path::Path, content: &[u8]) -> (ModelInfo, SocketAddr) {
        let src = dir.join("source.bin");
        std::fs::write(&src, content).unwrap();
        let library = Arc::new(ModelLibrary::new(dir.join("provider")));
        let mut m = ModelInfo::new("blob");
        m.format = "bin".into();
        let sidecar = library.import(&src, m).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_loop(listener, library, CancellationToken::new()));
        (sidecar.model, addr)
    }

    async fn fixture(http: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut content = vec![0u8; 300 * 1024];
        rand::thread_rng().fill_bytes(&mut content);
        let (model, addr) = provider(dir.path(), &content).await;

        let catalog = Arc::new(CapabilityCatalog::new("consumer", 300));
        catalog.apply_gossip(
            &CatalogGossip {
                node_id: "provider".into(),
                node_name: "box".into(),
                timestamp: unix_now(),
                models: vec![model],
                transfer_endpoints: TransferEndpoints {
                    http: http.then(|| format!("http://{addr}")),
                    websocket: None,
                },
                ttl_seconds: None,
            },
            unix_now(),
        );
        let library = Arc::new(ModelLibrary::new(dir.path().join("consumer")));
        let cancel = CancellationToken::new();
        let consumer = Arc::new(
            TransferCoordinator::new(catalog.clone(), library, cancel.clone(), Handle::current()).unwrap(),
        );
        Fixture {
            _dir: dir,
            content,
            consumer,
            catalog,
            cancel,
        }
    }

    fn reliability(catalog: &CapabilityCatalog) -> f64 {
        catalog.entry("blob").unwrap().providers[0].reliability
    }

    #[tokio::test]
    async fn resume_appends_to_partial_file() {
        let f = fixture(true).await;
        let partial = f.consumer.layout().partial_path("blob");
        std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
        std::fs::write(&partial, &f.content[..100_000]).unwrap();

        let state = f.consumer.run("blob", None, &f.cancel).await;
        let path = match state {
            TransferState::Completed { path } => path,
            other => panic!("unexpected state {other:?}"),
        };
        let got = std::fs::read(&path).unwrap();
        assert_eq!(sha256_hex(&got), sha256_hex(&f.content));
        assert!(!partial.exists());
        assert!(f.consumer.library.is_present("blob"));
        assert_eq!(
            f.consumer.library.find("blob").unwrap().0.source_peer.as_deref(),
            Some("provider")
        );
        assert!((reliability(&f.catalog) - INITIAL_RELIABILITY).abs() < 1e-9);
    }

    #[tokio::test]
    async fn corrupt_prefix_fails_verification_and_penalizes() {
        let f = fixture(true).await;
        let partial = f.consumer.layout().partial_path("blob");
        std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
        // a ranged response is appended, so a wrong prefix survives into the hash
        std::fs::write(&partial, vec![0xAA; 1000]).unwrap();

        let state = f.consumer.run("blob", None, &f.cancel).await;
        assert!(matches!(&state, TransferState::Failed { reason } if reason.contains("hash mismatch")));
        assert!(!partial.exists());
        assert!(!f.consumer.library.is_present("blob"));
        assert!((reliability(&f.catalog) - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn complete_partial_goes_straight_to_verify() {
        let f = fixture(true).await;
        let partial = f.consumer.layout().partial_path("blob");
        std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
        std::fs::write(&partial, &f.content).unwrap();
        let state = f.consumer.run("blob", None, &f.cancel).await;
        assert!(matches!(state, TransferState::Completed { .. }));
    }

    #[tokio::test]
    async fn cancelled_download_keeps_partial() {
        let f = fixture(true).await;
        let partial = f.consumer.layout().partial_path("blob");
        std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
        std::fs::write(&partial, &f.content[..10]).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(f.consumer.run("blob", None, &token).await, TransferState::Cancelled);
        assert_eq!(std::fs::read(&partial).unwrap(), &f.content[..10]);
    }

    #[tokio::test]
    async fn stalled_provider_fails_and_is_penalized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\nabc")
                        .await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CapabilityCatalog::new("consumer", 300));
        let mut model = ModelInfo::new("blob");
        model.sha256 = "ab".repeat(32);
        catalog.apply_gossip(
            &CatalogGossip {
                node_id: "provider".into(),
                node_name: "box".into(),
                timestamp: unix_now(),
                models: vec![model],
                transfer_endpoints: TransferEndpoints {
                    http: Some(format!("http://{addr}")),
                    websocket: None,
                },
                ttl_seconds: None,
            },
            unix_now(),
        );
        let library = Arc::new(ModelLibrary::new(dir.path().join("consumer")));
        let consumer = Arc::new(
            TransferCoordinator::new(catalog.clone(), library, CancellationToken::new(), Handle::current())
                .unwrap()
                .with_stall_timeout(Duration::from_millis(300)),
        );

        assert!(consumer.start("blob", None).is_some());
        let mut done = None;
        for _ in 0..250 {
            match consumer.state("blob") {
                Some(s) if s.is_terminal() => {
                    done = Some(s);
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(
            matches!(&done, Some(TransferState::Failed { reason }) if reason.contains("sent nothing")),
            "{done:?}"
        );
        assert!((reliability(&catalog) - 0.9).abs() < 1e-9);
        // the three bytes received are kept for the next attempt
        assert_eq!(std::fs::read(consumer.layout().partial_path("blob")).unwrap(), b"abc");
        // a failed transfer does not block a retry
        assert!(consumer.start("blob", None).is_some());
    }

    #[tokio::test]
    async fn provider_without_http_fails_readably() {
        let f = fixture(false).await;
        let state = f.consumer.run("blob", None, &f.cancel).await;
        assert!(matches!(&state, TransferState::Failed { reason } if reason.contains("no HTTP endpoint")));
    }

    #[tokio::test]
    async fn start_runs_in_background_and_refuses_duplicates() {
        let f = fixture(true).await;
        assert!(f.consumer.start("../etc", None).is_none());
        assert!(f.consumer.start("unknown", None).is_none());
        assert!(matches!(f.consumer.state("unknown"), Some(TransferState::Failed { .. })));

        assert!(f.consumer.start("blob", Some("provider")).is_some());
        assert!(f.consumer.start("blob", None).is_none());
        let mut done = None;
        for _ in 0..250 {
            match f.consumer.state("blob") {
                Some(s) if s.is_terminal() => {
                    done = Some(s);
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(matches!(done, Some(TransferState::Completed { .. })));
        assert!(f.consumer.start("blob", None).is_none());
        assert!(!f.consumer.cancel("blob"));
    }
}
