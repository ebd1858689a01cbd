//! Embedding backends.
//!
//! - `FastEmbedBackend`: ONNX model files resolved by the [`ModelManager`],
//!   run through fastembed
//! - `DisabledEmbedder`: placeholder selected when embeddings are turned off
//!
//! The hash backend lives in `hash.rs`.

use std::sync::Mutex;

use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};

use crate::models::registry::{
    CONFIG_FILE, ONNX_FILE, SPECIAL_TOKENS_FILE, TOKENIZER_CONFIG_FILE, TOKENIZER_FILE,
};
use crate::models::{ModelError, ModelKind, ModelManager, PoolingKind};
use crate::progress::ProgressEvent;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embeddings unavailable: {0}")]
    Unavailable(String),

    #[error("Embeddings misconfigured: {0}")]
    Misconfigured(String),
}

impl EmbeddingError {
    /// Programmer or configuration errors that must reach the caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            EmbeddingError::DimensionMismatch { .. } | EmbeddingError::Misconfigured(_) => true,
            EmbeddingError::Model(e) => e.is_config_error(),
            _ => false,
        }
    }
}

/// Something that turns text into fixed-length vectors.
pub trait TextEmbedder: Send + Sync {
    /// Model identifier; stored alongside persisted vectors
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn is_available(&self) -> bool {
        true
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Output order matches input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// fastembed model built from files in the model cache.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedBackend {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedBackend {
    /// Resolve (and download if allowed) the configured embedding model, then load it.
    ///
    /// Fails with [`EmbeddingError::DimensionMismatch`] if the model's output
    /// length differs from its registry entry.
    pub fn load(
        manager: &ModelManager,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<Self, EmbeddingError> {
        let spec = manager.resolve(ModelKind::Embedding)?.clone();
        let dir = manager.ensure_model(ModelKind::Embedding, progress)?;

        let read = |name: &str| {
            std::fs::read(dir.join(name)).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to read {}: {}", name, e))
            })
        };

        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read(TOKENIZER_FILE)?,
            config_file: read(CONFIG_FILE)?,
            special_tokens_map_file: read(SPECIAL_TOKENS_FILE)?,
            tokenizer_config_file: read(TOKENIZER_CONFIG_FILE)?,
        };

        let mut user_model = UserDefinedEmbeddingModel::new(read(ONNX_FILE)?, tokenizer_files);
        if let Some(pooling) = spec.pooling {
            user_model = user_model.with_pooling(match pooling {
                PoolingKind::Mean => Pooling::Mean,
                PoolingKind::Cls => Pooling::Cls,
            });
        }

        let mut model =
            TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        // Get model dimensions by embedding a test string
        let dimensions = Self::probe_dimensions(&mut model)?;
        if let Some(expected) = spec.dimensions {
            if expected != dimensions {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    got: dimensions,
                });
            }
        }

        log::info!(
            "Loaded embedding model '{}' ({} dimensions) from {}",
            spec.id,
            dimensions,
            dir.display()
        );

        Ok(Self {
            model: Mutex::new(model),
            model_name: spec.id,
            dimensions,
        })
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model.embed(vec!["test"], None).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e))
        })?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl TextEmbedder for FastEmbedBackend {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Embedder that is never available.
pub struct DisabledEmbedder;

impl TextEmbedder for DisabledEmbedder {
    fn name(&self) -> &str {
        "disabled"
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn is_available(&self) -> bool {
        false
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable(
            "embeddings are disabled".to_string(),
        ))
    }
}

/// Cosine similarity of two vectors of equal length.
///
/// Returns 0.0 when either vector has zero magnitude. Comparing vectors of
/// different lengths is a programming error and always fails.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot / (norm_a * norm_b))
}

/// Compute L2 norm of a vector.
pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}
