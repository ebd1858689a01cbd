//! Second-pass scoring of the top fused candidates.
//!
//! Scores are non-negative; the pipeline treats a candidate missing from a
//! reranker's output as scoring 0.

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use serde::Serialize;

use crate::config::{RerankBackendKind, RerankConfig};
use crate::models::ModelManager;
use crate::semantic::lexical::tokenize;

#[derive(Debug, thiserror::Error)]
pub enum RerankError {
    #[error("Reranker unavailable: {0}")]
    Unavailable(String),

    #[error("Reranking failed: {0}")]
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RerankerInput {
    pub skill_name: String,
    pub query: String,
    pub skill_description: String,
    pub skill_tags: Vec<String>,
}

impl RerankerInput {
    /// Text the reranker judges against the query.
    fn document(&self) -> String {
        let mut document = format!("{}. {}", self.skill_name, self.skill_description);
        if !self.skill_tags.is_empty() {
            document.push_str(" tags: ");
            document.push_str(&self.skill_tags.join(", "));
        }
        document
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RerankerOutput {
    pub skill_name: String,
    pub score: f32,
}

pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    fn score(&self, inputs: &[RerankerInput]) -> Result<Vec<RerankerOutput>, RerankError>;
}

/// Build the reranker selected by `config`.
pub fn from_config(config: &RerankConfig, models: &ModelManager) -> Box<dyn Reranker> {
    match config.backend {
        RerankBackendKind::CrossEncoder => Box::new(CrossEncoderReranker::new(
            models.model_dir().join("rerankers"),
            models.config().auto_download,
        )),
        RerankBackendKind::TermOverlap => Box::new(TermOverlapReranker),
        RerankBackendKind::Disabled => Box::new(DisabledReranker),
    }
}

enum CrossEncoderState {
    NotLoaded,
    Ready(TextRerank),
    Failed(String),
}

/// fastembed BGE cross-encoder, loaded on first use.
///
/// Raw logits go through a sigmoid so scores land in (0, 1).
pub struct CrossEncoderReranker {
    cache_dir: PathBuf,
    allow_download: bool,
    state: Mutex<CrossEncoderState>,
}

impl CrossEncoderReranker {
    pub fn new(cache_dir: PathBuf, allow_download: bool) -> Self {
        Self {
            cache_dir,
            allow_download,
            state: Mutex::new(CrossEncoderState::NotLoaded),
        }
    }

    /// Snapshot directory holding every file the model needs, if cached.
    fn cached_snapshot(&self) -> Option<PathBuf> {
        let snapshots = self.cache_dir.join(RERANKER_REPO_DIR).join("snapshots");
        std::fs::read_dir(snapshots)
            .ok()?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .find(|dir| RERANKER_FILES.iter().all(|file| dir.join(file).is_file()))
    }

    fn load(&self) -> Result<TextRerank, RerankError> {
        if !self.allow_download && self.cached_snapshot().is_none() {
            return Err(RerankError::Unavailable(format!(
                "no cached reranker in {} and auto-download is disabled",
                self.cache_dir.display()
            )));
        }

        log::info!("Loading cross-encoder reranker into {}", self.cache_dir.display());
        let options = RerankInitOptions::new(RerankerModel::BGERerankerBase)
            .with_cache_dir(self.cache_dir.clone())
            .with_show_download_progress(false);

        TextRerank::try_new(options).map_err(|e| RerankError::Unavailable(e.to_string()))
    }
}

/// hf-hub cache directory of `BAAI/bge-reranker-base`
const RERANKER_REPO_DIR: &str = "models--BAAI--bge-reranker-base";

/// Files fastembed opens from a reranker snapshot
const RERANKER_FILES: &[&str] = &[
    "onnx/model.onnx",
    "tokenizer.json",
    "config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        "bge-reranker-base"
    }

    fn is_available(&self) -> bool {
        match self.state.lock() {
            Ok(state) => !matches!(*state, CrossEncoderState::Failed(_)),
            Err(_) => false,
        }
    }

    fn score(&self, inputs: &[RerankerInput]) -> Result<Vec<RerankerOutput>, RerankError> {
        let Some(query) = inputs.first().map(|input| input.query.clone()) else {
            return Ok(vec![]);
        };

        let mut state = self
            .state
            .lock()
            .map_err(|e| RerankError::Failed(format!("lock poisoned: {e}")))?;

        if matches!(*state, CrossEncoderState::NotLoaded) {
            *state = match self.load() {
                Ok(model) => CrossEncoderState::Ready(model),
                Err(e) => {
                    log::warn!("Cross-encoder unavailable, reranking disabled: {}", e);
                    CrossEncoderState::Failed(e.to_string())
                }
            };
        }

        let model = match &mut *state {
            CrossEncoderState::Ready(model) => model,
            CrossEncoderState::Failed(reason) => {
                return Err(RerankError::Unavailable(reason.clone()))
            }
            CrossEncoderState::NotLoaded => {
                return Err(RerankError::Unavailable("model not loaded".to_string()))
            }
        };

        let documents: Vec<String> = inputs.iter().map(RerankerInput::document).collect();
        let document_refs: Vec<&str> = documents.iter().map(String::as_str).collect();

        let ranked = model
            .rerank(query.as_str(), document_refs, false, None)
            .map_err(|e| RerankError::Failed(e.to_string()))?;

        Ok(ranked
            .into_iter()
            .filter_map(|result| {
                inputs.get(result.index).map(|input| RerankerOutput {
                    skill_name: input.skill_name.clone(),
                    score: sigmoid(result.score),
                })
            })
            .collect())
    }
}

/// Fraction of query terms contained in the skill's name, description or tags.
pub struct TermOverlapReranker;

impl Reranker for TermOverlapReranker {
    fn name(&self) -> &str {
        "term-overlap"
    }

    fn score(&self, inputs: &[RerankerInput]) -> Result<Vec<RerankerOutput>, RerankError> {
        Ok(inputs
            .iter()
            .map(|input| {
                let terms = tokenize(&input.query);
                let haystack = input.document().to_lowercase();
                let score = if terms.is_empty() {
                    0.0
                } else {
                    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                    hits as f32 / terms.len() as f32
                };
                RerankerOutput {
                    skill_name: input.skill_name.clone(),
                    score,
                }
            })
            .collect())
    }
}

pub struct DisabledReranker;

impl Reranker for DisabledReranker {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn score(&self, _inputs: &[RerankerInput]) -> Result<Vec<RerankerOutput>, RerankError> {
        Err(RerankError::Unavailable("reranking is disabled".to_string()))
    }
}
