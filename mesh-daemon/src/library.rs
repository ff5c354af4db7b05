//! Local model library: completed model files plus their JSON sidecars in the models directory.

use std::io;
use std::path::{Path, PathBuf};

use mesh_core::integrity::{digest_matches, hash_file};
use mesh_core::transfer::is_safe_model_id;
use mesh_core::{unix_now, ModelInfo, ModelLayout, ModelSidecar};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("unsafe model id {0:?}")]
    UnsafeId(String),
    #[error("declared sha256 does not match file contents")]
    HashMismatch,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),
}

pub struct ModelLibrary {
    layout: ModelLayout,
}

impl ModelLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: ModelLayout::new(root),
        }
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    /// Every model whose sidecar parses and whose file is present, ordered by id.
    pub fn list(&self) -> Vec<ModelSidecar> {
        let dir = match std::fs::read_dir(self.layout.root()) {
            Ok(d) => d,
            Err(e) => {
                debug!(dir = %self.layout.root().display(), error = %e, "models dir not readable");
                return Vec::new();
            }
        };
        let mut out: Vec<ModelSidecar> = dir
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| read_sidecar(&p))
            .filter(|s| self.layout.root().join(&s.file_name).is_file())
            .collect();
        out.sort_by(|a, b| a.model.model_id.cmp(&b.model.model_id));
        out
    }

    /// Sidecar and file path of a complete local model.
    pub fn find(&self, model_id: &str) -> Option<(ModelSidecar, PathBuf)> {
        if !is_safe_model_id(model_id) {
            return None;
        }
        let sidecar = read_sidecar(&self.layout.sidecar_path(model_id))?;
        let path = self.layout.root().join(&sidecar.file_name);
        path.is_file().then_some((sidecar, path))
    }

    pub fn is_present(&self, model_id: &str) -> bool {
        self.find(model_id).is_some()
    }

    pub fn write_sidecar(&self, sidecar: &ModelSidecar) -> Result<(), LibraryError> {
        std::fs::create_dir_all(self.layout.root())?;
        let json = serde_json::to_vec_pretty(sidecar)?;
        std::fs::write(self.layout.sidecar_path(&sidecar.model.model_id), json)?;
        Ok(())
    }

    /// Copy a file into the library so it can be shared. Fills in `sha256` and `size_bytes`
    /// when absent; a declared hash must match.
    pub fn import(&self, source: &Path, mut model: ModelInfo) -> Result<ModelSidecar, LibraryError> {
        if !is_safe_model_id(&model.model_id) {
            return Err(LibraryError::UnsafeId(model.model_id));
        }
        let actual = hash_file(source)?;
        if model.sha256.trim().is_empty() {
            model.sha256 = actual;
        } else if !digest_matches(&actual, &model.sha256) {
            return Err(LibraryError::HashMismatch);
        }
        std::fs::create_dir_all(self.layout.root())?;
        let dest = self.layout.final_path(&model);
        model.size_bytes = std::fs::copy(source, &dest)?;
        let sidecar = ModelSidecar {
            file_name: ModelLayout::file_name(&model),
            model,
            downloaded_at: unix_now(),
            source_peer: None,
        };
        self.write_sidecar(&sidecar)?;
        info!(model_id = %sidecar.model.model_id, path = %dest.display(), "model imported");
        Ok(sidecar)
    }
}

fn read_sidecar(path: &Path) -> Option<ModelSidecar> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice::<ModelSidecar>(&bytes) {
        Ok(s) if is_safe_model_id(&s.model.model_id) => Some(s),
        Ok(_) => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "skipping malformed sidecar");
            None
        }
    }
}
