//! Embedding service for skills and queries.
//!
//! Provides a high-level interface over a [`TextEmbedder`]:
//! - Lazy-loads the backend on first use (downloading model files if allowed)
//! - Can run a model download on a background thread
//! - Remembers a failed load for the rest of the session
//! - Builds canonical skill text and chunked document embeddings

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use chrono::Utc;

use crate::config::{EmbeddingBackendKind, EmbeddingConfig};
use crate::models::{ModelKind, ModelManager};
use crate::progress::{no_progress, ProgressEvent, ProgressPhase};
use crate::semantic::chunking::{chunk_lines, ChunkingConfig};
use crate::semantic::embeddings::{EmbeddingError, FastEmbedBackend, TextEmbedder};
use crate::semantic::hash::HashEmbedder;
use crate::semantic::preprocess::skill_text;
use crate::skill::{Chunk, SkillEmbedding, SkillSummary};

/// Which embedder the service builds on first use.
#[derive(Clone)]
pub enum EmbeddingBackend {
    /// fastembed model resolved through the model manager
    Local(Arc<ModelManager>),
    /// Offline hashing embedder with the given dimension
    Hash(usize),
    Disabled,
    /// Caller-supplied embedder
    Custom(Arc<dyn TextEmbedder>),
}

impl EmbeddingBackend {
    pub fn from_config(config: &EmbeddingConfig, models: Arc<ModelManager>) -> Self {
        match config.backend {
            EmbeddingBackendKind::Local => EmbeddingBackend::Local(models),
            EmbeddingBackendKind::Hash => EmbeddingBackend::Hash(config.hash_dimensions),
            EmbeddingBackendKind::Disabled => EmbeddingBackend::Disabled,
        }
    }
}

enum ServiceState {
    NotLoaded,
    /// A load runs on some thread without the lock held.
    Loading,
    Ready(Arc<dyn TextEmbedder>),
    Failed { reason: String, fatal: bool },
}

struct Slot {
    state: ServiceState,
    /// Bumped by `dispose` so a loader started earlier cannot publish.
    generation: u64,
}

/// State shared with background loaders.
struct Shared {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Slot>, EmbeddingError> {
        self.slot
            .lock()
            .map_err(|e| EmbeddingError::Unavailable(format!("Lock poisoned: {}", e)))
    }

    /// Record the outcome of a load started at `generation` and wake waiters.
    fn publish(
        &self,
        generation: u64,
        result: Result<Arc<dyn TextEmbedder>, EmbeddingError>,
        log_failure: bool,
    ) -> Result<Arc<dyn TextEmbedder>, EmbeddingError> {
        let mut slot = self.lock()?;
        if slot.generation == generation {
            slot.state = match &result {
                Ok(embedder) => {
                    log::info!(
                        "Embedding backend '{}' ready ({} dimensions)",
                        embedder.name(),
                        embedder.dimensions()
                    );
                    ServiceState::Ready(Arc::clone(embedder))
                }
                Err(e) => {
                    if log_failure {
                        log::warn!(
                            "Embedding initialization failed, search will be keyword-only: {}",
                            e
                        );
                    }
                    ServiceState::Failed {
                        reason: e.to_string(),
                        fatal: e.is_fatal(),
                    }
                }
            };
        } else {
            log::debug!("Discarding embedding load started before dispose");
        }
        self.changed.notify_all();
        result
    }
}

pub struct EmbeddingService {
    backend: EmbeddingBackend,
    chunking: ChunkingConfig,
    /// Uses Mutex instead of OnceLock so a failed load can be recorded and reset.
    /// Shared with the background loader thread.
    shared: Arc<Shared>,
}

impl EmbeddingService {
    pub fn new(backend: EmbeddingBackend, config: &EmbeddingConfig) -> Self {
        Self {
            backend,
            chunking: ChunkingConfig::from(config),
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: ServiceState::NotLoaded,
                    generation: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn from_config(config: &EmbeddingConfig, models: Arc<ModelManager>) -> Self {
        Self::new(EmbeddingBackend::from_config(config, models), config)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, EmbeddingBackend::Disabled)
    }

    /// False once a load attempt has failed, or when disabled.
    pub fn is_available(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.shared
            .lock()
            .map(|slot| !matches!(slot.state, ServiceState::Failed { .. }))
            .unwrap_or(false)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared
            .lock()
            .map(|slot| matches!(slot.state, ServiceState::Ready(_)))
            .unwrap_or(false)
    }

    /// True while a load runs on another thread.
    pub fn is_loading(&self) -> bool {
        self.shared
            .lock()
            .map(|slot| matches!(slot.state, ServiceState::Loading))
            .unwrap_or(false)
    }

    /// Load the backend. Idempotent.
    ///
    /// Blocks until the model is ready, including while another thread is
    /// loading it.
    pub fn initialize(&self) -> Result<(), EmbeddingError> {
        self.initialize_with_progress(&no_progress)
    }

    /// Load the backend, reporting model download progress.
    pub fn initialize_with_progress(
        &self,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<(), EmbeddingError> {
        self.ready(progress).map(|_| ())
    }

    /// Make the backend ready without waiting on a download.
    ///
    /// Returns `Ok(true)` once the backend is usable and `Ok(false)` while a
    /// model download runs in the background. Backends that need no download
    /// load on the calling thread. A failed load is returned and remembered
    /// as with [`initialize`](Self::initialize).
    pub fn initialize_in_background(&self) -> Result<bool, EmbeddingError> {
        let (models, generation) = {
            let mut slot = self.shared.lock()?;
            match &slot.state {
                ServiceState::Ready(_) => return Ok(true),
                ServiceState::Loading => return Ok(false),
                ServiceState::Failed { reason, fatal } => return Err(remembered(reason, *fatal)),
                ServiceState::NotLoaded => {}
            }

            let models = match &self.backend {
                EmbeddingBackend::Local(models) if needs_download(models) => Arc::clone(models),
                _ => {
                    drop(slot);
                    return self.ready(&no_progress).map(|_| true);
                }
            };
            slot.state = ServiceState::Loading;
            (models, slot.generation)
        };

        log::info!(
            "Downloading embedding model '{}' in the background",
            models.config().embed_model_id
        );
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("embedding-loader".to_string())
            .spawn(move || {
                let result = FastEmbedBackend::load(&models, &log_progress)
                    .map(|backend| Arc::new(backend) as Arc<dyn TextEmbedder>);
                let _ = shared.publish(generation, result, true);
            });

        match spawned {
            Ok(_) => Ok(false),
            Err(e) => {
                let err = EmbeddingError::InitFailed(format!("Failed to spawn loader: {}", e));
                self.shared.publish(generation, Err(err), true).map(|_| true)
            }
        }
    }

    /// Model identifier of the loaded backend.
    pub fn model_name(&self) -> Option<String> {
        self.loaded().map(|embedder| embedder.name().to_string())
    }

    /// Vector length of the loaded backend.
    pub fn dimensions(&self) -> Option<usize> {
        self.loaded().map(|embedder| embedder.dimensions())
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embedder = self.ready(&no_progress)?;
        let vector = embedder.embed(text)?;
        check_dimensions(embedder.as_ref(), &vector)?;
        Ok(vector)
    }

    /// Embed several texts; output order matches input order.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let embedder = self.ready(&no_progress)?;
        let vectors = embedder.embed_batch(texts)?;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        for vector in &vectors {
            check_dimensions(embedder.as_ref(), vector)?;
        }
        Ok(vectors)
    }

    /// Embed the canonical text of a skill.
    pub fn embed_skill(&self, skill: &SkillSummary) -> Result<SkillEmbedding, EmbeddingError> {
        let text = skill_text(skill);
        let vector = self.embed(&text)?;

        Ok(SkillEmbedding {
            skill_name: skill.name.clone(),
            vector,
            text_content: text,
            chunks: None,
            generated_at: Utc::now(),
        })
    }

    /// Embed a skill plus overlapping chunks of its full document.
    ///
    /// A document too short to yield any chunk produces `chunks: None`.
    pub fn embed_skill_with_chunks(
        &self,
        skill: &SkillSummary,
        document: &str,
    ) -> Result<SkillEmbedding, EmbeddingError> {
        let mut embedding = self.embed_skill(skill)?;

        let pieces = chunk_lines(document, &self.chunking);
        if pieces.is_empty() {
            return Ok(embedding);
        }

        let texts: Vec<String> = pieces.iter().map(|piece| piece.content.clone()).collect();
        let vectors = self.embed_batch(&texts)?;

        let chunks = pieces
            .into_iter()
            .zip(vectors)
            .map(|(piece, vector)| Chunk {
                content: piece.content,
                vector,
                start_line: piece.start_line,
                end_line: piece.end_line,
            })
            .collect();
        embedding.chunks = Some(chunks);

        Ok(embedding)
    }

    /// Drop the loaded model and forget any recorded failure.
    ///
    /// A load still in flight finishes on its own thread and is discarded.
    pub fn dispose(&self) {
        if let Ok(mut slot) = self.shared.lock() {
            match slot.state {
                ServiceState::Ready(_) => log::debug!("Releasing embedding model"),
                ServiceState::Loading => log::debug!("Abandoning embedding load in flight"),
                _ => {}
            }
            slot.state = ServiceState::NotLoaded;
            slot.generation += 1;
            self.shared.changed.notify_all();
        }
    }

    fn loaded(&self) -> Option<Arc<dyn TextEmbedder>> {
        match &self.shared.lock().ok()?.state {
            ServiceState::Ready(embedder) => Some(Arc::clone(embedder)),
            _ => None,
        }
    }

    /// Return the loaded backend, loading it on this thread if needed.
    ///
    /// The state lock is never held across the load itself.
    fn ready(
        &self,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<Arc<dyn TextEmbedder>, EmbeddingError> {
        let generation = {
            let mut slot = self.shared.lock()?;
            loop {
                match &slot.state {
                    ServiceState::Ready(embedder) => return Ok(Arc::clone(embedder)),
                    ServiceState::Failed { reason, fatal } => {
                        return Err(remembered(reason, *fatal))
                    }
                    ServiceState::Loading => {}
                    ServiceState::NotLoaded => break,
                }
                slot = self
                    .shared
                    .changed
                    .wait(slot)
                    .map_err(|e| EmbeddingError::Unavailable(format!("Lock poisoned: {}", e)))?;
            }
            slot.state = ServiceState::Loading;
            slot.generation
        };

        let result = self.load(progress);
        let log_failure = !matches!(self.backend, EmbeddingBackend::Disabled);
        self.shared.publish(generation, result, log_failure)
    }

    fn load(
        &self,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<Arc<dyn TextEmbedder>, EmbeddingError> {
        match &self.backend {
            EmbeddingBackend::Local(models) => {
                log::info!(
                    "Initializing embeddings with model '{}'",
                    models.config().embed_model_id
                );
                Ok(Arc::new(FastEmbedBackend::load(models, progress)?))
            }
            EmbeddingBackend::Hash(dimensions) => Ok(Arc::new(HashEmbedder::new(*dimensions))),
            EmbeddingBackend::Disabled => Err(EmbeddingError::Unavailable(
                "embeddings are disabled".to_string(),
            )),
            EmbeddingBackend::Custom(embedder) if embedder.is_available() => {
                Ok(Arc::clone(embedder))
            }
            EmbeddingBackend::Custom(embedder) => Err(EmbeddingError::Unavailable(format!(
                "embedder '{}' is not available",
                embedder.name()
            ))),
        }
    }
}

fn remembered(reason: &str, fatal: bool) -> EmbeddingError {
    if fatal {
        EmbeddingError::Misconfigured(reason.to_string())
    } else {
        EmbeddingError::Unavailable(reason.to_string())
    }
}

/// A local model whose files are missing and may be fetched.
fn needs_download(models: &ModelManager) -> bool {
    models.config().auto_download && matches!(models.is_present(ModelKind::Embedding), Ok(false))
}

fn log_progress(event: &ProgressEvent) {
    if event.phase != ProgressPhase::Downloading {
        log::debug!("embedding model: {}", event.message);
    }
}

fn check_dimensions(embedder: &dyn TextEmbedder, vector: &[f32]) -> Result<(), EmbeddingError> {
    if vector.len() != embedder.dimensions() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: embedder.dimensions(),
            got: vector.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalModelConfig;

    fn hash_service(dimensions: usize) -> EmbeddingService {
        EmbeddingService::new(EmbeddingBackend::Hash(dimensions), &EmbeddingConfig::default())
    }

    /// Claims one dimension, returns another.
    struct LyingEmbedder;

    impl TextEmbedder for LyingEmbedder {
        fn name(&self) -> &str {
            "lying"
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0; 3])
        }
    }

    #[test]
    fn test_lazy_initialization() {
        let service = hash_service(32);
        assert!(!service.is_initialized());
        assert_eq!(service.dimensions(), None);

        let v = service.embed("hello world").unwrap();
        assert_eq!(v.len(), 32);
        assert!(service.is_initialized());
        assert_eq!(service.dimensions(), Some(32));
        assert_eq!(service.model_name().as_deref(), Some("hash-fnv1a-32"));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let service = hash_service(8);
        service.initialize().unwrap();
        service.initialize().unwrap();
        assert!(service.is_available());
    }

    #[test]
    fn test_disabled_backend() {
        let service =
            EmbeddingService::new(EmbeddingBackend::Disabled, &EmbeddingConfig::default());
        assert!(!service.is_enabled());
        assert!(!service.is_available());
        assert!(matches!(
            service.embed("x"),
            Err(EmbeddingError::Unavailable(_))
        ));
    }

    #[test]
    fn test_failed_load_is_remembered_until_dispose() {
        let dir = tempfile::tempdir().unwrap();
        let models = Arc::new(ModelManager::new(LocalModelConfig {
            model_dir: dir.path().to_path_buf(),
            auto_download: false,
            ..LocalModelConfig::default()
        }));
        let service = EmbeddingService::new(
            EmbeddingBackend::Local(models),
            &EmbeddingConfig::default(),
        );

        assert!(service.is_available());
        let first = service.initialize().unwrap_err();
        assert!(matches!(first, EmbeddingError::Model(_)));
        assert!(!service.is_available());

        let second = service.embed("query").unwrap_err();
        assert!(matches!(second, EmbeddingError::Unavailable(_)));
        assert!(!second.is_fatal());

        service.dispose();
        assert!(service.is_available());
    }

    #[test]
    fn test_background_initialize_loads_inline_without_download() {
        let service = hash_service(8);
        assert!(service.initialize_in_background().unwrap());
        assert!(service.is_initialized());
        assert!(!service.is_loading());
    }

    #[test]
    fn test_background_initialize_remembers_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let models = Arc::new(ModelManager::new(LocalModelConfig {
            model_dir: dir.path().to_path_buf(),
            auto_download: false,
            ..LocalModelConfig::default()
        }));
        let service = EmbeddingService::new(
            EmbeddingBackend::Local(models),
            &EmbeddingConfig::default(),
        );

        let first = service.initialize_in_background().unwrap_err();
        assert!(matches!(first, EmbeddingError::Model(_)));
        assert!(!service.is_loading());

        let second = service.initialize_in_background().unwrap_err();
        assert!(matches!(second, EmbeddingError::Unavailable(_)));
    }

    #[test]
    fn test_load_finished_after_dispose_is_discarded() {
        let service = hash_service(8);
        let generation = {
            let mut slot = service.shared.lock().unwrap();
            slot.state = ServiceState::Loading;
            slot.generation
        };
        assert!(service.is_loading());

        service.dispose();
        let late: Arc<dyn TextEmbedder> = Arc::new(HashEmbedder::new(8));
        assert!(service.shared.publish(generation, Ok(late), true).is_ok());
        assert!(!service.is_initialized());
        assert!(!service.is_loading());

        service.initialize().unwrap();
        assert!(service.is_initialized());
    }

    #[test]
    fn test_unknown_model_stays_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let models = Arc::new(ModelManager::new(LocalModelConfig {
            embed_model_id: "no-such-model".to_string(),
            model_dir: dir.path().to_path_buf(),
            ..LocalModelConfig::default()
        }));
        let service = EmbeddingService::new(
            EmbeddingBackend::Local(models),
            &EmbeddingConfig::default(),
        );

        assert!(service.initialize().unwrap_err().is_fatal());
        assert!(service.embed("again").unwrap_err().is_fatal());
    }

    #[test]
    fn test_wrong_output_length_is_dimension_mismatch() {
        let service = EmbeddingService::new(
            EmbeddingBackend::Custom(Arc::new(LyingEmbedder)),
            &EmbeddingConfig::default(),
        );

        let err = service.embed("text").unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 4,
                got: 3
            }
        ));
    }

    #[test]
    fn test_embed_batch_preserves_order() {
        let service = hash_service(64);
        let texts = vec!["alpha beta".to_string(), "gamma delta".to_string()];
        let batch = service.embed_batch(&texts).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], service.embed("alpha beta").unwrap());
        assert_eq!(batch[1], service.embed("gamma delta").unwrap());
    }

    #[test]
    fn test_embed_skill_uses_canonical_text() {
        let service = hash_service(16);
        let skill = SkillSummary::new("React-Auth", "Login").with_tags(["react"]);

        let embedding = service.embed_skill(&skill).unwrap();
        assert_eq!(embedding.skill_name, "React-Auth");
        assert_eq!(embedding.text_content, "react-auth. login. tags: react");
        assert_eq!(embedding.dimensions(), 16);
        assert!(embedding.chunks.is_none());
    }

    #[test]
    fn test_embed_skill_with_chunks() {
        let config = EmbeddingConfig {
            max_tokens: 10,
            chars_per_token: 4,
            min_chunk_size: 10,
            ..EmbeddingConfig::default()
        };
        let service = EmbeddingService::new(EmbeddingBackend::Hash(16), &config);
        let skill = SkillSummary::new("docs", "long document");
        let document = (1..=20)
            .map(|i| format!("line number {:02}", i))
            .collect::<Vec<_>>()
            .join("\n");

        let embedding = service.embed_skill_with_chunks(&skill, &document).unwrap();
        let chunks = embedding.chunks.unwrap();

        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start_line, 1);
        assert!(chunks.iter().all(|c| c.vector.len() == 16));
        assert!(chunks.windows(2).all(|w| w[0].start_line < w[1].start_line));
    }

    #[test]
    fn test_short_document_has_no_chunks() {
        let service = hash_service(16);
        let skill = SkillSummary::new("x", "y");
        let embedding = service.embed_skill_with_chunks(&skill, "short").unwrap();
        assert!(embedding.chunks.is_none());
    }
}
