//! Hybrid retrieval for skill catalogs.
//!
//! Vector similarity from a local embedding model and keyword relevance are
//! fused with Reciprocal Rank Fusion, then optionally refined by a reranker
//! with position-aware blending. Missing optional infrastructure (model
//! files, vector storage, expansion or rerank backends) degrades the search
//! to keyword-only instead of failing it.

pub mod config;
pub mod expansion;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod rerank;
pub mod semantic;
pub mod skill;
#[cfg(test)]
mod tests;

pub use config::Config;
pub use expansion::{ExpandedQuery, QueryExpander};
pub use models::{ModelError, ModelKind, ModelManager};
pub use pipeline::{
    HybridSearchPipeline, HybridSearchResponse, HybridSearchResult, IndexReport, PipelineState,
    SearchError, SearchFilters, SearchOptions, SearchStats, SearchTiming,
};
pub use progress::{ProgressEvent, ProgressPhase};
pub use rerank::{Reranker, RerankerInput, RerankerOutput};
pub use skill::{Chunk, Compatibility, SkillEmbedding, SkillSummary};
