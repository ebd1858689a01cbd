mod pipeline;

use std::sync::Arc;

use crate::config::{EmbeddingConfig, SearchConfig};
use crate::expansion::{QueryExpander, RelatedTermsExpansion};
use crate::pipeline::HybridSearchPipeline;
use crate::rerank::TermOverlapReranker;
use crate::semantic::{
    EmbeddingBackend, EmbeddingService, FileVectorStore, LexicalKeywordIndex,
};
use crate::skill::SkillSummary;

pub(crate) const HASH_DIMENSIONS: usize = 256;

pub(crate) fn skill(name: &str, description: &str, tags: &[&str]) -> SkillSummary {
    SkillSummary::new(name, description).with_tags(tags.iter().copied())
}

/// Fully offline pipeline: hashing embedder, file vector store under `dir`,
/// related-terms expansion and term-overlap reranking.
pub(crate) fn hash_pipeline(dir: &std::path::Path) -> HybridSearchPipeline {
    let search = SearchConfig::default();
    HybridSearchPipeline::new(
        search.clone(),
        EmbeddingService::new(
            EmbeddingBackend::Hash(HASH_DIMENSIONS),
            &EmbeddingConfig::default(),
        ),
        Box::new(FileVectorStore::new(
            dir.join("skill-vectors.bin"),
            search.vector_threshold,
        )),
        Arc::new(LexicalKeywordIndex::new()),
        QueryExpander::new(Some(Box::new(RelatedTermsExpansion::builtin())), 2.0, 3),
        Box::new(TermOverlapReranker),
    )
}
