//! Known model artifacts.
//!
//! Each entry names the files a model needs and where to fetch them. The
//! embedding dimension recorded here is authoritative: every vector produced
//! by a model must have exactly this length.

use serde::{Deserialize, Serialize};

use crate::models::ModelError;

pub const ONNX_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const CONFIG_FILE: &str = "config.json";
pub const SPECIAL_TOKENS_FILE: &str = "special_tokens_map.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

const HF_BASE: &str = "https://huggingface.co";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Embedding,
    Generative,
}

/// Token pooling applied to transformer outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingKind {
    Mean,
    Cls,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    /// File name inside the model directory
    pub name: String,
    pub url: String,
}

impl ModelFile {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub kind: ModelKind,
    /// Output dimension (embedding models only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pooling: Option<PoolingKind>,
    pub files: Vec<ModelFile>,
}

impl ModelSpec {
    /// ONNX export plus the four tokenizer files fastembed expects, from a HF repo.
    fn onnx_embedding(id: &str, repo: &str, dimensions: usize, pooling: PoolingKind) -> Self {
        let file = |name: &str, path: &str| {
            ModelFile::new(name, format!("{HF_BASE}/{repo}/resolve/main/{path}"))
        };

        Self {
            id: id.to_string(),
            kind: ModelKind::Embedding,
            dimensions: Some(dimensions),
            pooling: Some(pooling),
            files: vec![
                file(ONNX_FILE, "onnx/model.onnx"),
                file(TOKENIZER_FILE, TOKENIZER_FILE),
                file(CONFIG_FILE, CONFIG_FILE),
                file(SPECIAL_TOKENS_FILE, SPECIAL_TOKENS_FILE),
                file(TOKENIZER_CONFIG_FILE, TOKENIZER_CONFIG_FILE),
            ],
        }
    }

    fn gguf(id: &str, repo: &str, file_name: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ModelKind::Generative,
            dimensions: None,
            pooling: None,
            files: vec![ModelFile::new(
                file_name,
                format!("{HF_BASE}/{repo}/resolve/main/{file_name}"),
            )],
        }
    }

    /// First listed file; the weights for every built-in model.
    pub fn primary_file(&self) -> Option<&ModelFile> {
        self.files.first()
    }
}

/// Table of models the manager can resolve.
#[derive(Clone, Debug)]
pub struct ModelRegistry {
    specs: Vec<ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelRegistry {
    pub fn new(specs: Vec<ModelSpec>) -> Self {
        Self { specs }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ModelSpec::onnx_embedding(
                "all-minilm-l6-v2",
                "Xenova/all-MiniLM-L6-v2",
                384,
                PoolingKind::Mean,
            ),
            ModelSpec::onnx_embedding(
                "bge-small-en-v1.5",
                "Xenova/bge-small-en-v1.5",
                384,
                PoolingKind::Cls,
            ),
            ModelSpec::onnx_embedding(
                "bge-base-en-v1.5",
                "Xenova/bge-base-en-v1.5",
                768,
                PoolingKind::Cls,
            ),
            ModelSpec::gguf(
                "qwen2.5-0.5b-instruct",
                "Qwen/Qwen2.5-0.5B-Instruct-GGUF",
                "qwen2.5-0.5b-instruct-q4_k_m.gguf",
            ),
        ])
    }

    /// Look up a model by id (case-insensitive).
    pub fn get(&self, id: &str) -> Result<&ModelSpec, ModelError> {
        let wanted = id.trim().to_lowercase();
        self.specs
            .iter()
            .find(|spec| spec.id.to_lowercase() == wanted)
            .ok_or_else(|| ModelError::UnknownModel {
                id: id.to_string(),
                known: self.ids(),
            })
    }

    pub fn ids(&self) -> Vec<String> {
        self.specs.iter().map(|spec| spec.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.specs.iter()
    }
}
