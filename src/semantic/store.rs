//! Vector store: persistent skill embeddings with nearest-neighbor search.
//!
//! `FileVectorStore` keeps a [`VectorIndex`] in memory and persists it with
//! [`VectorStorage`]. `DisabledVectorStore` is selected when vector storage is
//! turned off and reports itself as unavailable.

use std::path::PathBuf;
use std::sync::RwLock;

use serde::Serialize;

use crate::progress::{ProgressEvent, ProgressPhase};
use crate::semantic::index::{IndexError, SearchResult, VectorIndex};
use crate::semantic::storage::{model_id_hash, VectorStorage, VectorStorageError};
use crate::skill::SkillEmbedding;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("Vector store unavailable: {0}")]
    Unavailable(String),

    #[error("Vector store not initialized")]
    NotInitialized,

    #[error("No embedding model bound to the vector store")]
    ModelNotBound,

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),
}

impl VectorStoreError {
    /// Dimension mismatches are programming errors; everything else degrades.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VectorStoreError::Index(IndexError::DimensionMismatch { .. }))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub chunks: usize,
    pub dimensions: Option<usize>,
    pub path: Option<PathBuf>,
}

pub trait VectorStore: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Open or create the backing index. Idempotent.
    fn initialize(&self) -> Result<(), VectorStoreError>;

    /// Declare the model whose vectors will be stored and queried.
    ///
    /// Stored vectors from a different model are discarded.
    fn bind_model(&self, model_name: &str, dimensions: usize) -> Result<(), VectorStoreError>;

    /// Upsert embeddings by skill name and persist. Returns the number stored.
    fn store_batch(
        &self,
        embeddings: Vec<SkillEmbedding>,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<usize, VectorStoreError>;

    /// At most `k` matches, most similar first.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, VectorStoreError>;

    /// Remove every stored embedding.
    fn clear(&self) -> Result<(), VectorStoreError>;

    /// Release the in-memory index. A later `initialize` reopens it.
    fn close(&self);

    fn stats(&self) -> StoreStats;
}

struct OpenIndex {
    index: VectorIndex,
    model_id: Option<[u8; 32]>,
}

enum StoreState {
    Closed,
    Open(OpenIndex),
    Unavailable(String),
}

/// Vector store backed by a single binary file.
pub struct FileVectorStore {
    storage: VectorStorage,
    threshold: f32,
    state: RwLock<StoreState>,
}

impl FileVectorStore {
    pub fn new(path: PathBuf, threshold: f32) -> Self {
        Self {
            storage: VectorStorage::new(path),
            threshold,
            state: RwLock::new(StoreState::Closed),
        }
    }

    fn open(&self) -> Result<OpenIndex, VectorStoreError> {
        if !self.storage.exists() {
            if let Some(parent) = self.storage.path().parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    VectorStoreError::Unavailable(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            log::info!("No existing vector index, starting fresh");
            return Ok(Self::fresh(0, None));
        }

        match self.storage.load() {
            Ok(loaded) => {
                log::info!(
                    "Loaded {} skill vectors from {}",
                    loaded.index.len(),
                    self.storage.path().display()
                );
                Ok(OpenIndex {
                    index: loaded.index,
                    model_id: Some(loaded.model_id),
                })
            }
            Err(VectorStorageError::VersionMismatch(file_version, _)) => {
                log::warn!(
                    "Vector storage version {} unsupported, creating fresh index",
                    file_version
                );
                Ok(Self::fresh(0, None))
            }
            Err(e) => Err(VectorStoreError::Unavailable(format!(
                "failed to load {}: {}",
                self.storage.path().display(),
                e
            ))),
        }
    }

    fn fresh(dimensions: usize, model_id: Option<[u8; 32]>) -> OpenIndex {
        OpenIndex {
            index: VectorIndex::new(dimensions),
            model_id,
        }
    }

    fn poisoned(e: impl std::fmt::Display) -> VectorStoreError {
        VectorStoreError::Unavailable(format!("Lock poisoned: {}", e))
    }
}

impl VectorStore for FileVectorStore {
    fn name(&self) -> &str {
        "file"
    }

    fn is_available(&self) -> bool {
        self.state
            .read()
            .map(|state| !matches!(*state, StoreState::Unavailable(_)))
            .unwrap_or(false)
    }

    fn initialize(&self) -> Result<(), VectorStoreError> {
        let mut state = self.state.write().map_err(Self::poisoned)?;
        match &*state {
            StoreState::Open(_) => return Ok(()),
            StoreState::Unavailable(reason) => {
                return Err(VectorStoreError::Unavailable(reason.clone()))
            }
            StoreState::Closed => {}
        }

        match self.open() {
            Ok(open) => {
                *state = StoreState::Open(open);
                Ok(())
            }
            Err(e) => {
                log::warn!("Vector store unavailable: {}", e);
                *state = StoreState::Unavailable(e.to_string());
                Err(e)
            }
        }
    }

    fn bind_model(&self, model_name: &str, dimensions: usize) -> Result<(), VectorStoreError> {
        let mut state = self.state.write().map_err(Self::poisoned)?;
        let StoreState::Open(open) = &mut *state else {
            return Err(VectorStoreError::NotInitialized);
        };

        let model_id = model_id_hash(model_name);
        if open.model_id == Some(model_id) && open.index.dimensions() == dimensions {
            return Ok(());
        }

        if !open.index.is_empty() {
            log::warn!(
                "Embedding model changed to '{}', discarding {} stored vectors",
                model_name,
                open.index.len()
            );
        }
        *open = Self::fresh(dimensions, Some(model_id));
        Ok(())
    }

    fn store_batch(
        &self,
        embeddings: Vec<SkillEmbedding>,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<usize, VectorStoreError> {
        let mut state = self.state.write().map_err(Self::poisoned)?;
        let StoreState::Open(open) = &mut *state else {
            return Err(VectorStoreError::NotInitialized);
        };
        let model_id = open.model_id.ok_or(VectorStoreError::ModelNotBound)?;

        let total = embeddings.len() as u64;
        for (i, embedding) in embeddings.into_iter().enumerate() {
            let name = embedding.skill_name.clone();
            open.index.upsert(embedding)?;
            progress(&ProgressEvent::new(
                ProgressPhase::Storing,
                i as u64 + 1,
                Some(total),
                name,
            ));
        }

        self.storage.save(&open.index, &model_id)?;
        log::debug!(
            "Persisted {} skill vectors to {}",
            open.index.len(),
            self.storage.path().display()
        );

        Ok(total as usize)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, VectorStoreError> {
        let state = self.state.read().map_err(Self::poisoned)?;
        let StoreState::Open(open) = &*state else {
            return Err(VectorStoreError::NotInitialized);
        };

        if open.index.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        Ok(open.index.search(query, self.threshold, k)?)
    }

    fn clear(&self) -> Result<(), VectorStoreError> {
        let mut state = self.state.write().map_err(Self::poisoned)?;
        let StoreState::Open(open) = &mut *state else {
            return Err(VectorStoreError::NotInitialized);
        };

        open.index.clear();
        self.storage.delete()?;
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.write() {
            *state = StoreState::Closed;
        }
    }

    fn stats(&self) -> StoreStats {
        let path = Some(self.storage.path().to_path_buf());
        match self.state.read().as_deref() {
            Ok(StoreState::Open(open)) => StoreStats {
                records: open.index.len(),
                chunks: open.index.chunk_count(),
                dimensions: open.model_id.map(|_| open.index.dimensions()),
                path,
            },
            _ => StoreStats {
                path,
                ..StoreStats::default()
            },
        }
    }
}

/// Store used when vector storage is turned off.
pub struct DisabledVectorStore;

impl DisabledVectorStore {
    fn unavailable() -> VectorStoreError {
        VectorStoreError::Unavailable("vector storage is disabled".to_string())
    }
}

impl VectorStore for DisabledVectorStore {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn initialize(&self) -> Result<(), VectorStoreError> {
        Err(Self::unavailable())
    }

    fn bind_model(&self, _model_name: &str, _dimensions: usize) -> Result<(), VectorStoreError> {
        Err(Self::unavailable())
    }

    fn store_batch(
        &self,
        _embeddings: Vec<SkillEmbedding>,
        _progress: &dyn Fn(&ProgressEvent),
    ) -> Result<usize, VectorStoreError> {
        Err(Self::unavailable())
    }

    fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<SearchResult>, VectorStoreError> {
        Err(Self::unavailable())
    }

    fn clear(&self) -> Result<(), VectorStoreError> {
        Ok(())
    }

    fn close(&self) {}

    fn stats(&self) -> StoreStats {
        StoreStats::default()
    }
}
