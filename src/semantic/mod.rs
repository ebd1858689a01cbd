//! Semantic retrieval infrastructure for skill search.
//!
//! # Architecture
//!
//! - `embeddings`: `TextEmbedder` trait, fastembed backend, cosine similarity
//! - `hash`: offline FNV-1a hashing embedder
//! - `service`: `EmbeddingService`, lazy backend lifecycle and skill embedding
//! - `chunking`: overlapping line windows for long documents
//! - `preprocess`: canonical skill text
//! - `index`: in-memory vector index with cosine similarity search
//! - `storage`: binary file I/O for skill-vectors.bin persistence
//! - `store`: `VectorStore` trait with file-backed and disabled implementations
//! - `lexical`: `KeywordProvider` contract and the built-in keyword index
//! - `hybrid`: reciprocal rank fusion and position-aware blending

mod chunking;
pub mod embeddings;
mod hash;
pub mod hybrid;
mod index;
pub mod lexical;
mod preprocess;
mod service;
mod storage;
mod store;

pub use chunking::{chunk_lines, ChunkingConfig, TextChunk};
pub use embeddings::{
    cosine_similarity, DisabledEmbedder, EmbeddingError, FastEmbedBackend, TextEmbedder,
};
pub use hash::HashEmbedder;
pub use hybrid::{
    finalize_ranking, merge_rankings, normalize_scores, position_aware_blend,
    reciprocal_rank_fusion, weighted_combine, BlendedCandidate, RankSource, RankerResult,
    RrfInput, RrfRanking, ScoredCandidate, SourceRank,
};
pub use index::{IndexError, SearchResult, VectorEntry, VectorIndex};
pub use lexical::{KeywordError, KeywordHit, KeywordProvider, KeywordQuery, LexicalKeywordIndex};
pub use preprocess::skill_text;
pub use service::{EmbeddingBackend, EmbeddingService};
pub use storage::{model_id_hash, VectorStorage, VectorStorageError};
pub use store::{DisabledVectorStore, FileVectorStore, StoreStats, VectorStore, VectorStoreError};
