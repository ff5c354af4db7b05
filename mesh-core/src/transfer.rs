//! Model transfer state machine, progress math and on-disk layout of a models directory.
//!
//! `Idle → Preparing → Downloading → Verifying → {Completed | Failed | Cancelled}`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::ModelInfo;

/// Minimum spacing between two progress snapshots.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

const PARTIAL_SUFFIX: &str = "part";
const SIDECAR_SUFFIX: &str = "json";
const MAX_MODEL_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub bytes_per_sec: f64,
    pub eta_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Preparing,
    Downloading(TransferProgress),
    Verifying,
    Completed { path: PathBuf },
    Failed { reason: String },
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed { .. } | TransferState::Failed { .. } | TransferState::Cancelled
        )
    }

    /// A transfer is running and a second request for the same model must be refused.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferState::Preparing | TransferState::Downloading(_) | TransferState::Verifying
        )
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TransferState::Failed {
            reason: reason.into(),
        }
    }
}

/// Counts bytes for one download attempt and decides when to publish a snapshot.
/// Elapsed time is passed in by the caller.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    resumed_from: u64,
    downloaded: u64,
    total: Option<u64>,
    last_emit: Option<Duration>,
}

impl ProgressTracker {
    /// `resumed_from` bytes were already on disk; `total` is the full file size if known.
    pub fn new(resumed_from: u64, total: Option<u64>) -> Self {
        Self {
            resumed_from,
            downloaded: resumed_from,
            total,
            last_emit: None,
        }
    }

    pub fn record(&mut self, n: usize) {
        self.downloaded += n as u64;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Rate counts only bytes fetched in this attempt.
    pub fn snapshot(&self, elapsed: Duration) -> TransferProgress {
        let secs = elapsed.as_secs_f64();
        let fetched = self.downloaded - self.resumed_from;
        let rate = if secs > 0.0 { fetched as f64 / secs } else { 0.0 };
        let eta = match self.total {
            Some(total) if rate > 0.0 => Some(total.saturating_sub(self.downloaded) as f64 / rate),
            _ => None,
        };
        TransferProgress {
            bytes_downloaded: self.downloaded,
            total_bytes: self.total,
            bytes_per_sec: rate,
            eta_secs: eta,
        }
    }

    /// Snapshot if at least `PROGRESS_INTERVAL` passed since the previous one.
    pub fn poll(&mut self, elapsed: Duration) -> Option<TransferProgress> {
        if let Some(prev) = self.last_emit {
            if elapsed.saturating_sub(prev) < PROGRESS_INTERVAL {
                return None;
            }
        }
        self.last_emit = Some(elapsed);
        Some(self.snapshot(elapsed))
    }
}

/// Model ids become file names, so only a conservative character set is allowed.
pub fn is_safe_model_id(model_id: &str) -> bool {
    !model_id.is_empty()
        && model_id.len() <= MAX_MODEL_ID_LEN
        && !model_id.starts_with('.')
        && model_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Metadata written next to a completed model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSidecar {
    pub model: ModelInfo,
    pub file_name: String,
    pub downloaded_at: u64,
    #[serde(default)]
    pub source_peer: Option<String>,
}

/// Where a model's files live inside a models directory.
#[derive(Debug, Clone)]
pub struct ModelLayout {
    root: PathBuf,
}

impl ModelLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Temporary file a download streams into.
    pub fn partial_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}.{PARTIAL_SUFFIX}"))
    }

    pub fn sidecar_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}.{SIDECAR_SUFFIX}"))
    }

    /// Final file name: `{model_id}.{format}`, or a `.bin` fallback when no usable format is declared.
    pub fn file_name(model: &ModelInfo) -> String {
        let ext = model.format.trim();
        let ext = if !ext.is_empty()
            && ext != PARTIAL_SUFFIX
            && ext != SIDECAR_SUFFIX
            && ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            ext
        } else {
            "bin"
        };
        format!("{}.{}", model.model_id, ext)
    }

    pub fn final_path(&self, model: &ModelInfo) -> PathBuf {
        self.root.join(Self::file_name(model))
    }
}
