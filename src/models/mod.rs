//! Local model artifacts: resolution, download and on-disk caching.
//!
//! - `registry`: known model ids and the files they consist of
//! - `manager`: `ModelManager::ensure_model`, streamed downloads with atomic rename
//! - `lock`: advisory single-writer lock over the model directory

mod lock;
mod manager;
pub mod registry;

use std::path::PathBuf;

pub use lock::ModelDirLock;
pub use manager::ModelManager;
pub use registry::{ModelFile, ModelKind, ModelRegistry, ModelSpec, PoolingKind};

/// Errors raised while resolving or fetching model artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Unknown model '{id}'. Known models: {}", .known.join(", "))]
    UnknownModel { id: String, known: Vec<String> },

    #[error("Model '{id}' is a {actual:?} model, expected {expected:?}")]
    WrongKind {
        id: String,
        expected: ModelKind,
        actual: ModelKind,
    },

    #[error("Model '{id}' is not available at {} and auto-download is disabled", .path.display())]
    ModelUnavailable { id: String, path: PathBuf },

    #[error("Download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// Configuration mistakes that retrying or degrading cannot fix.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ModelError::UnknownModel { .. } | ModelError::WrongKind { .. }
        )
    }
}
