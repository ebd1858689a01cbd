use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default embedding model (small, 384 dimensions, mean pooling)
const DEFAULT_EMBED_MODEL: &str = "all-minilm-l6-v2";
/// Default generative model used for query expansion
const DEFAULT_LLM_MODEL: &str = "qwen2.5-0.5b-instruct";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Environment variable overriding `models.model_dir`
pub const MODEL_DIR_ENV: &str = "SKILLSEARCH_MODEL_DIR";

const DEFAULT_VECTOR_FILE: &str = "skill-vectors.bin";

/// Process-level model configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalModelConfig {
    /// Registry id of the embedding model
    #[serde(default = "default_embed_model")]
    pub embed_model_id: String,

    /// Registry id of the generative model
    #[serde(default = "default_llm_model")]
    pub llm_model_id: String,

    /// Directory holding downloaded model artifacts
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Download missing artifacts on first use
    #[serde(default = "default_true")]
    pub auto_download: bool,

    /// Number of layers to offload to an accelerator (generative model host)
    #[serde(default)]
    pub gpu_layers: u32,

    /// Timeout for a single artifact download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            embed_model_id: default_embed_model(),
            llm_model_id: default_llm_model(),
            model_dir: default_model_dir(),
            auto_download: true,
            gpu_layers: 0,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackendKind {
    /// ONNX model resolved through the model manager
    Local,
    /// Deterministic hashed token features, no model files
    Hash,
    Disabled,
}

/// Embedding and chunking settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_backend")]
    pub backend: EmbeddingBackendKind,

    /// Dimensions of the hash backend
    #[serde(default = "default_hash_dimensions")]
    pub hash_dimensions: usize,

    /// Token budget of a single chunk
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Approximate characters per token
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    /// Fraction of a chunk repeated at the start of the next one [0.0, 1.0)
    #[serde(default = "default_overlap_percent")]
    pub overlap_percent: f32,

    /// Chunks shorter than this (in characters) are dropped
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            hash_dimensions: default_hash_dimensions(),
            max_tokens: default_max_tokens(),
            chars_per_token: default_chars_per_token(),
            overlap_percent: default_overlap_percent(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

/// Retrieval/reranker weight split applied to one rank bucket.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightPair {
    pub retrieval: f32,
    pub reranker: f32,
}

impl WeightPair {
    pub const fn new(retrieval: f32, reranker: f32) -> Self {
        Self {
            retrieval,
            reranker,
        }
    }
}

/// Weight pairs for position-aware blending, by pre-rerank rank.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    /// Ranks 1-3
    pub top: WeightPair,
    /// Ranks 4-10
    pub middle: WeightPair,
    /// Ranks 11+
    pub tail: WeightPair,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            top: WeightPair::new(0.75, 0.25),
            middle: WeightPair::new(0.60, 0.40),
            tail: WeightPair::new(0.40, 0.60),
        }
    }
}

impl BlendWeights {
    /// Weight pair for a 1-based rank inside the reranked window.
    pub fn for_rank(&self, rank: usize) -> WeightPair {
        match rank {
            0..=3 => self.top,
            4..=10 => self.middle,
            _ => self.tail,
        }
    }
}

/// Hybrid search pipeline settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// RRF damping constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,

    /// Nearest neighbours fetched per requested result
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,

    /// Minimum cosine similarity for vector candidates
    #[serde(default)]
    pub vector_threshold: f32,

    #[serde(default = "default_true")]
    pub enable_expansion: bool,

    #[serde(default = "default_true")]
    pub enable_rerank: bool,

    #[serde(default = "default_true")]
    pub position_aware_blending: bool,

    /// Number of RRF candidates sent to the reranker
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,

    #[serde(default)]
    pub blend_weights: BlendWeights,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            rrf_k: default_rrf_k(),
            overfetch_factor: default_overfetch_factor(),
            vector_threshold: 0.0,
            enable_expansion: true,
            enable_rerank: true,
            position_aware_blending: true,
            rerank_top_n: default_rerank_top_n(),
            blend_weights: BlendWeights::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionBackendKind {
    /// Tag-relation table lookups
    RelatedTerms,
    /// OpenAI-compatible chat endpoint serving the generative model
    Llm,
    Disabled,
}

/// Query expansion settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpansionConfig {
    #[serde(default = "default_expansion_backend")]
    pub backend: ExpansionBackendKind,

    /// Weight of the literal query's keyword scores
    #[serde(default = "default_original_weight")]
    pub original_weight: f32,

    #[serde(default = "default_max_variations")]
    pub max_variations: usize,

    /// YAML file mapping a term to related terms (built-in table if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_terms_path: Option<PathBuf>,

    /// Base URL of the chat completions server
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            backend: default_expansion_backend(),
            original_weight: default_original_weight(),
            max_variations: default_max_variations(),
            related_terms_path: None,
            endpoint: default_llm_endpoint(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankBackendKind {
    /// fastembed cross-encoder
    CrossEncoder,
    /// Query-token containment heuristic
    TermOverlap,
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_backend")]
    pub backend: RerankBackendKind,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            backend: default_rerank_backend(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Index file (defaults to `skill-vectors.bin` in the base directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: LocalModelConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_embed_model() -> String {
    DEFAULT_EMBED_MODEL.to_string()
}

fn default_llm_model() -> String {
    DEFAULT_LLM_MODEL.to_string()
}

fn default_model_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(MODEL_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = my_home().ok().flatten().unwrap_or_else(std::env::temp_dir);
    home.join(".cache").join("skillsearch").join("models")
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_embedding_backend() -> EmbeddingBackendKind {
    EmbeddingBackendKind::Local
}

fn default_hash_dimensions() -> usize {
    384
}

fn default_max_tokens() -> usize {
    512
}

fn default_chars_per_token() -> usize {
    4
}

fn default_overlap_percent() -> f32 {
    0.15
}

fn default_min_chunk_size() -> usize {
    100
}

fn default_limit() -> usize {
    10
}

fn default_rrf_k() -> f32 {
    60.0
}

fn default_overfetch_factor() -> usize {
    3
}

fn default_rerank_top_n() -> usize {
    30
}

fn default_expansion_backend() -> ExpansionBackendKind {
    ExpansionBackendKind::RelatedTerms
}

fn default_original_weight() -> f32 {
    2.0
}

fn default_max_variations() -> usize {
    3
}

fn default_llm_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_rerank_backend() -> RerankBackendKind {
    RerankBackendKind::CrossEncoder
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.search.overfetch_factor == 0 {
            self.search.overfetch_factor = 1
        }

        if self.search.rrf_k <= 0.0 || !self.search.rrf_k.is_finite() {
            bail!("search.rrf_k must be a positive number, got {}", self.search.rrf_k);
        }

        if !(0.0..1.0).contains(&self.embedding.overlap_percent) {
            bail!(
                "embedding.overlap_percent must be in [0.0, 1.0), got {}",
                self.embedding.overlap_percent
            );
        }

        if self.embedding.max_tokens == 0 || self.embedding.chars_per_token == 0 {
            bail!("embedding.max_tokens and embedding.chars_per_token must be greater than 0");
        }

        if self.embedding.min_chunk_size > self.embedding.max_chars_per_chunk() {
            bail!(
                "embedding.min_chunk_size ({}) exceeds the chunk budget of {} characters",
                self.embedding.min_chunk_size,
                self.embedding.max_chars_per_chunk()
            );
        }

        if self.embedding.backend == EmbeddingBackendKind::Hash
            && self.embedding.hash_dimensions == 0
        {
            bail!("embedding.hash_dimensions must be greater than 0");
        }

        if self.expansion.original_weight <= 0.0 {
            bail!(
                "expansion.original_weight must be greater than 0, got {}",
                self.expansion.original_weight
            );
        }

        if self.expansion.backend == ExpansionBackendKind::Llm {
            url::Url::parse(&self.expansion.endpoint).with_context(|| {
                format!("expansion.endpoint is not a valid url: {}", self.expansion.endpoint)
            })?;
        }

        if self.models.download_timeout_secs == 0 {
            bail!("models.download_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults when missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&config_path, defaults)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        let config_path = self.base_path.join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, config_str)
            .with_context(|| format!("failed to write {}", config_path.display()))
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolved location of the persistent vector index.
    pub fn vector_store_path(&self) -> PathBuf {
        self.vector_store
            .path
            .clone()
            .unwrap_or_else(|| self.base_path.join(DEFAULT_VECTOR_FILE))
    }
}

impl EmbeddingConfig {
    pub fn max_chars_per_chunk(&self) -> usize {
        self.max_tokens * self.chars_per_token
    }

    pub fn overlap_chars(&self) -> usize {
        (self.max_chars_per_chunk() as f32 * self.overlap_percent) as usize
    }
}
