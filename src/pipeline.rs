//! Hybrid search pipeline.
//!
//! Sequences query expansion, query embedding, vector and keyword retrieval,
//! rank fusion and reranking into one request/response cycle. Every optional
//! subsystem degrades on failure; in the worst case a search silently becomes
//! keyword-only. Only configuration and programming errors reach the caller.
//!
//! Index builds mutate shared state and must not overlap with each other or
//! with searches; callers serialize rebuilds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{Config, SearchConfig};
use crate::expansion::{ExpandedQuery, QueryExpander};
use crate::models::ModelManager;
use crate::progress::{ProgressEvent, ProgressPhase};
use crate::rerank::{self, Reranker, RerankerInput};
use crate::semantic::lexical::matched_terms;
use crate::semantic::{
    finalize_ranking, reciprocal_rank_fusion, DisabledVectorStore, EmbeddingError,
    EmbeddingService, FileVectorStore, KeywordError, KeywordProvider, KeywordQuery,
    LexicalKeywordIndex, RankSource, RankerResult, RrfInput, VectorStore, VectorStoreError,
};
use crate::skill::{SkillEmbedding, SkillSummary};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    #[error(transparent)]
    Keyword(#[from] KeywordError),

    #[error("Pipeline state lock poisoned: {0}")]
    Poisoned(String),
}

impl SearchError {
    /// Configuration or programming errors; everything else is degraded around.
    pub fn is_fatal(&self) -> bool {
        match self {
            SearchError::Embedding(e) => e.is_fatal(),
            SearchError::VectorStore(e) => e.is_fatal(),
            SearchError::Keyword(_) | SearchError::Poisoned(_) => false,
        }
    }
}

fn poisoned(e: impl std::fmt::Display) -> SearchError {
    SearchError::Poisoned(e.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Narrows fused candidates. Tags must all be present; category and source
/// match exactly, ignoring case.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.category.is_none() && self.source.is_none()
    }

    pub fn matches(&self, skill: &SkillSummary) -> bool {
        let same = |wanted: &Option<String>, actual: &Option<String>| match wanted {
            None => true,
            Some(wanted) => actual
                .as_deref()
                .is_some_and(|actual| actual.eq_ignore_ascii_case(wanted)),
        };

        self.tags
            .iter()
            .all(|tag| skill.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
            && same(&self.category, &skill.category)
            && same(&self.source, &skill.source)
    }
}

/// One search request. `None` fields fall back to [`SearchConfig`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub expand: Option<bool>,
    #[serde(default)]
    pub rerank: Option<bool>,
    #[serde(default)]
    pub position_aware_blending: Option<bool>,
    #[serde(default)]
    pub filters: SearchFilters,
}

impl SearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_expansion(mut self, enabled: bool) -> Self {
        self.expand = Some(enabled);
        self
    }

    pub fn with_rerank(mut self, enabled: bool) -> Self {
        self.rerank = Some(enabled);
        self
    }

    pub fn with_blending(mut self, enabled: bool) -> Self {
        self.position_aware_blending = Some(enabled);
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridSearchResult {
    pub skill: SkillSummary,
    /// `round(hybrid_score * 100)`
    pub relevance: u8,
    pub hybrid_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_similarity: Option<f32>,
    /// Best expansion-weighted keyword relevance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker_score: Option<f32>,
    pub matched_terms: Vec<String>,
    /// Expansion variants that matched this skill
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_terms: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryInfo {
    pub original: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded: Option<ExpandedQuery>,
}

/// Milliseconds spent per phase.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTiming {
    pub expansion: f64,
    pub embedding: f64,
    pub vector_search: f64,
    pub keyword_search: f64,
    pub fusion: f64,
    pub reranking: f64,
    pub total: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStats {
    pub candidates_from_vector: usize,
    pub candidates_from_keyword: usize,
    pub total_merged: usize,
    pub reranked: usize,
    /// No query vector was available
    pub keyword_only: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HybridSearchResponse {
    pub results: Vec<HybridSearchResult>,
    pub query: QueryInfo,
    pub timing: SearchTiming,
    pub stats: SearchStats,
}

impl HybridSearchResponse {
    fn empty(original: &str) -> Self {
        Self {
            results: Vec::new(),
            query: QueryInfo {
                original: original.to_string(),
                expanded: None,
            },
            timing: SearchTiming::default(),
            stats: SearchStats::default(),
        }
    }
}

/// Outcome of [`HybridSearchPipeline::build_index`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IndexReport {
    pub skills: usize,
    pub embedded: usize,
    pub chunks: usize,
    pub keyword_only: bool,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}

pub struct HybridSearchPipeline {
    config: SearchConfig,
    embeddings: EmbeddingService,
    store: Box<dyn VectorStore>,
    keyword: Arc<dyn KeywordProvider>,
    expander: QueryExpander,
    reranker: Box<dyn Reranker>,
    state: Mutex<PipelineState>,
    skills: RwLock<HashMap<String, SkillSummary>>,
}

impl HybridSearchPipeline {
    pub fn new(
        config: SearchConfig,
        embeddings: EmbeddingService,
        store: Box<dyn VectorStore>,
        keyword: Arc<dyn KeywordProvider>,
        expander: QueryExpander,
        reranker: Box<dyn Reranker>,
    ) -> Self {
        Self {
            config,
            embeddings,
            store,
            keyword,
            expander,
            reranker,
            state: Mutex::new(PipelineState::Uninitialized),
            skills: RwLock::new(HashMap::new()),
        }
    }

    /// Assemble every component from configuration, with the built-in
    /// keyword index.
    pub fn from_config(config: &Config) -> Self {
        Self::with_keyword_provider(config, Arc::new(LexicalKeywordIndex::new()))
    }

    pub fn with_keyword_provider(config: &Config, keyword: Arc<dyn KeywordProvider>) -> Self {
        let models = Arc::new(ModelManager::new(config.models.clone()));

        let store: Box<dyn VectorStore> = if config.vector_store.enabled {
            Box::new(FileVectorStore::new(
                config.vector_store_path(),
                config.search.vector_threshold,
            ))
        } else {
            Box::new(DisabledVectorStore)
        };

        Self::new(
            config.search.clone(),
            EmbeddingService::from_config(&config.embedding, Arc::clone(&models)),
            store,
            keyword,
            QueryExpander::from_config(&config.expansion, &config.models),
            rerank::from_config(&config.rerank, &models),
        )
    }

    pub fn state(&self) -> PipelineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(PipelineState::Uninitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PipelineState::Ready
    }

    pub fn vector_store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }

    pub fn embeddings(&self) -> &EmbeddingService {
        &self.embeddings
    }

    /// Open the vector store. Idempotent; an unavailable store only logs.
    pub fn initialize(&self) -> Result<(), SearchError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if *state == PipelineState::Ready {
            return Ok(());
        }
        *state = PipelineState::Initializing;

        if self.store.is_available() {
            if let Err(e) = self.store.initialize() {
                log::warn!(
                    "Vector store '{}' unavailable, keyword-only search: {}",
                    self.store.name(),
                    e
                );
            }
        } else {
            log::info!("Vector store disabled, keyword-only search");
        }

        *state = PipelineState::Ready;
        Ok(())
    }

    /// Rebuild the whole index from `skills`.
    ///
    /// Embedding failures degrade to a keyword-only index and are reported
    /// through `progress` rather than returned.
    pub fn build_index(
        &self,
        skills: &[SkillSummary],
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<IndexReport, SearchError> {
        let _span = tracing::info_span!("build_index", skills = skills.len()).entered();
        self.initialize()?;

        {
            let mut map = self.skills.write().map_err(poisoned)?;
            map.clear();
            map.extend(skills.iter().map(|skill| (skill.name.clone(), skill.clone())));
        }

        progress(&ProgressEvent::new(
            ProgressPhase::Indexing,
            0,
            Some(skills.len() as u64),
            "Loading keyword index",
        ));
        self.keyword.index(skills)?;

        let mut report = IndexReport {
            skills: skills.len(),
            ..Default::default()
        };

        match self.embed_catalog(skills, progress) {
            Ok(Some((embedded, chunks))) => {
                report.embedded = embedded;
                report.chunks = chunks;
            }
            Ok(None) => {
                report.keyword_only = true;
                progress(&ProgressEvent::message(
                    ProgressPhase::Embedding,
                    "Embeddings unavailable, index is keyword-only",
                ));
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("Embedding generation failed, index is keyword-only: {}", e);
                report.keyword_only = true;
                progress(&ProgressEvent::message(
                    ProgressPhase::Embedding,
                    "Embedding failed, index is keyword-only",
                ));
            }
        }

        log::info!(
            "Indexed {} skills ({} embedded, {} chunks)",
            report.skills,
            report.embedded,
            report.chunks
        );
        progress(&ProgressEvent::new(
            ProgressPhase::Complete,
            skills.len() as u64,
            Some(skills.len() as u64),
            "Index build complete",
        ));

        Ok(report)
    }

    /// Embed and store every skill. `None` when vectors are unavailable.
    ///
    /// The store is only cleared once every embedding succeeded, so a failed
    /// rebuild keeps the previous vectors.
    fn embed_catalog(
        &self,
        skills: &[SkillSummary],
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<Option<(usize, usize)>, SearchError> {
        if !self.vectors_ready(progress)? {
            return Ok(None);
        }

        let total = skills.len() as u64;
        let mut embeddings: Vec<SkillEmbedding> = Vec::with_capacity(skills.len());
        for (i, skill) in skills.iter().enumerate() {
            let embedding = match skill.content.as_deref() {
                Some(document) => self.embeddings.embed_skill_with_chunks(skill, document)?,
                None => self.embeddings.embed_skill(skill)?,
            };
            embeddings.push(embedding);
            progress(&ProgressEvent::new(
                ProgressPhase::Embedding,
                i as u64 + 1,
                Some(total),
                skill.name.clone(),
            ));
        }

        let chunks = embeddings.iter().map(SkillEmbedding::chunk_count).sum();
        self.store.clear()?;
        let stored = self.store.store_batch(embeddings, progress)?;
        Ok(Some((stored, chunks)))
    }

    /// Load the embedder, waiting for any download, and bind the store to it.
    ///
    /// `Ok(false)` means the vector path is unavailable for this call. A
    /// remembered misconfiguration is reported again on every call.
    fn vectors_ready(&self, progress: &dyn Fn(&ProgressEvent)) -> Result<bool, SearchError> {
        if !self.embeddings.is_enabled() || !self.store.is_available() {
            return Ok(false);
        }

        let loaded = self.embeddings.initialize_with_progress(progress).map(|()| true);
        self.bind_vectors(loaded)
    }

    /// Like [`vectors_ready`](Self::vectors_ready), but a model download
    /// runs in the background and leaves this call keyword-only.
    fn query_vectors_ready(&self) -> Result<bool, SearchError> {
        if !self.embeddings.is_enabled() || !self.store.is_available() {
            return Ok(false);
        }

        let loaded = self.embeddings.initialize_in_background();
        if matches!(loaded, Ok(false)) {
            log::debug!("Embedding model still loading, keyword-only search");
        }
        self.bind_vectors(loaded)
    }

    fn bind_vectors(&self, loaded: Result<bool, EmbeddingError>) -> Result<bool, SearchError> {
        match loaded {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(_) => return Ok(false),
        }

        let (Some(model), Some(dimensions)) =
            (self.embeddings.model_name(), self.embeddings.dimensions())
        else {
            return Ok(false);
        };

        match self.store.bind_model(&model, dimensions) {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                log::warn!("Vector store cannot serve '{}': {}", model, e);
                Ok(false)
            }
        }
    }

    pub fn search(&self, options: &SearchOptions) -> Result<HybridSearchResponse, SearchError> {
        let started = Instant::now();
        let query = options.query.trim();
        if query.is_empty() {
            return Ok(HybridSearchResponse::empty(&options.query));
        }

        let _span = tracing::debug_span!("search", query = %query).entered();
        self.initialize()?;

        let limit = options.limit.unwrap_or(self.config.default_limit);
        let fetch = limit.saturating_mul(self.config.overfetch_factor.max(1));
        let mut timing = SearchTiming::default();
        let mut stats = SearchStats::default();

        let expand = options.expand.unwrap_or(self.config.enable_expansion);
        let (expanded, elapsed) = timed(|| {
            if expand {
                self.expander.expand(query)
            } else {
                ExpandedQuery::degenerate(query, self.expander.original_weight())
            }
        });
        timing.expansion = millis(elapsed);

        let (query_vector, elapsed) = timed(|| self.embed_query(query));
        timing.embedding = millis(elapsed);
        let query_vector = query_vector?;
        stats.keyword_only = query_vector.is_none();

        let ((vector_hits, vector_elapsed), (keyword_hits, keyword_elapsed)) = rayon::join(
            || timed(|| self.vector_candidates(query_vector.as_deref(), fetch)),
            || timed(|| self.keyword_candidates(&expanded, fetch)),
        );
        timing.vector_search = millis(vector_elapsed);
        timing.keyword_search = millis(keyword_elapsed);
        let vector_hits = vector_hits?;
        stats.candidates_from_vector = vector_hits.len();
        stats.candidates_from_keyword = keyword_hits.len();

        let fusion_start = Instant::now();
        let skills = self.skills.read().map_err(poisoned)?;
        // Keyword first: exact RRF ties keep first-seen order
        let fused = reciprocal_rank_fusion(
            &[
                RrfInput {
                    source: RankSource::Keyword,
                    results: keyword_hits.clone(),
                },
                RrfInput {
                    source: RankSource::Vector,
                    results: vector_hits.clone(),
                },
            ],
            self.config.rrf_k,
        );
        stats.total_merged = fused.len();
        let fused: Vec<_> = fused
            .into_iter()
            .filter(|ranking| {
                skills
                    .get(&ranking.skill_name)
                    .is_some_and(|skill| options.filters.matches(skill))
            })
            .collect();
        timing.fusion = millis(fusion_start.elapsed());

        let rerank_start = Instant::now();
        let window = self.config.rerank_top_n.min(fused.len());
        let rerank = options.rerank.unwrap_or(self.config.enable_rerank);
        let reranker_scores = if rerank && window > 0 && self.reranker.is_available() {
            let inputs: Vec<RerankerInput> = fused[..window]
                .iter()
                .filter_map(|ranking| skills.get(&ranking.skill_name))
                .map(|skill| RerankerInput {
                    skill_name: skill.name.clone(),
                    query: query.to_string(),
                    skill_description: skill.description.clone(),
                    skill_tags: skill.tags.clone(),
                })
                .collect();

            match self.reranker.score(&inputs) {
                Ok(outputs) => {
                    stats.reranked = inputs.len();
                    Some(
                        outputs
                            .into_iter()
                            .map(|output| (output.skill_name, output.score))
                            .collect::<HashMap<String, f32>>(),
                    )
                }
                Err(e) => {
                    log::warn!(
                        "Reranker '{}' failed, keeping fused order: {}",
                        self.reranker.name(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let blend = options
            .position_aware_blending
            .unwrap_or(self.config.position_aware_blending);
        let mut ranked = finalize_ranking(
            fused,
            reranker_scores.as_ref(),
            window,
            blend.then_some(&self.config.blend_weights),
        );
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(limit);
        timing.reranking = millis(rerank_start.elapsed());

        let vector_scores: HashMap<&str, f32> = vector_hits
            .iter()
            .map(|hit| (hit.skill_name.as_str(), hit.score))
            .collect();
        let keyword_scores: HashMap<&str, f32> = keyword_hits
            .iter()
            .map(|hit| (hit.skill_name.as_str(), hit.score))
            .collect();

        let results = ranked
            .into_iter()
            .filter_map(|candidate| {
                let skill = skills.get(&candidate.skill_name)?;
                let expanded_terms: Vec<String> = expanded
                    .variations
                    .iter()
                    .filter(|variation| !matched_terms(variation, skill).is_empty())
                    .cloned()
                    .collect();

                Some(HybridSearchResult {
                    relevance: (candidate.score * 100.0).round().clamp(0.0, 100.0) as u8,
                    hybrid_score: candidate.score,
                    vector_similarity: vector_scores.get(skill.name.as_str()).copied(),
                    keyword_score: keyword_scores.get(skill.name.as_str()).copied(),
                    rrf_score: Some(candidate.rrf_score),
                    reranker_score: candidate.reranker_score,
                    matched_terms: matched_terms(query, skill),
                    expanded_terms: (!expanded_terms.is_empty()).then_some(expanded_terms),
                    skill: skill.clone(),
                })
            })
            .collect::<Vec<_>>();
        drop(skills);

        timing.total = millis(started.elapsed());
        log::debug!(
            "search '{}': {} results in {:.1}ms (expand {:.1}, embed {:.1}, vector {:.1}, keyword {:.1}, fusion {:.1}, rerank {:.1})",
            query,
            results.len(),
            timing.total,
            timing.expansion,
            timing.embedding,
            timing.vector_search,
            timing.keyword_search,
            timing.fusion,
            timing.reranking
        );

        Ok(HybridSearchResponse {
            results,
            query: QueryInfo {
                original: query.to_string(),
                expanded: expanded.is_expanded().then_some(expanded),
            },
            timing,
            stats,
        })
    }

    /// Embed the original query. `None` when the vector path is unavailable.
    fn embed_query(&self, query: &str) -> Result<Option<Vec<f32>>, SearchError> {
        if !self.query_vectors_ready()? {
            return Ok(None);
        }

        match self.embeddings.embed(query) {
            Ok(vector) => Ok(Some(vector)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                log::warn!("Query embedding failed, keyword-only search: {}", e);
                Ok(None)
            }
        }
    }

    fn vector_candidates(
        &self,
        query_vector: Option<&[f32]>,
        fetch: usize,
    ) -> Result<Vec<RankerResult>, SearchError> {
        let Some(query_vector) = query_vector else {
            return Ok(vec![]);
        };

        match self.store.search(query_vector, fetch) {
            Ok(hits) => Ok(hits
                .into_iter()
                .map(|hit| RankerResult::new(hit.skill_name, hit.similarity))
                .collect()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                log::warn!("Vector search failed, keyword-only search: {}", e);
                Ok(vec![])
            }
        }
    }

    /// One keyword search per query variant, scores scaled by the variant's
    /// weight, keeping each skill's best weighted score.
    fn keyword_candidates(&self, expanded: &ExpandedQuery, fetch: usize) -> Vec<RankerResult> {
        let mut best: Vec<RankerResult> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (query, weight) in expanded.queries() {
            let request = KeywordQuery {
                query: query.to_string(),
                limit: fetch,
                semantic: true,
            };

            let hits = match self.keyword.search(&request) {
                Ok(hits) => hits,
                Err(e) => {
                    log::warn!("Keyword search for '{}' failed: {}", query, e);
                    continue;
                }
            };

            for hit in hits {
                let score = hit.relevance * weight;
                match positions.get(&hit.skill_name) {
                    Some(&i) => best[i].score = best[i].score.max(score),
                    None => {
                        positions.insert(hit.skill_name.clone(), best.len());
                        best.push(RankerResult::new(hit.skill_name, score));
                    }
                }
            }
        }

        best.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        best
    }

    /// Release the embedding model and the vector index.
    ///
    /// The next call to `initialize`, `build_index` or `search` reopens them.
    pub fn dispose(&self) {
        self.embeddings.dispose();
        self.store.close();
        if let Ok(mut state) = self.state.lock() {
            *state = PipelineState::Uninitialized;
        }
        log::debug!("Search pipeline disposed");
    }
}
