//! In-memory vector index with cosine similarity search.
//!
//! Stores skill embeddings (and their chunk embeddings) keyed by skill name.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::semantic::embeddings::l2_norm;
use crate::skill::{Chunk, SkillEmbedding};

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// Whole-document embedding
    pub vector: Vec<f32>,
    /// Text that was embedded
    pub text_content: String,
    pub chunks: Vec<Chunk>,
    pub generated_at: DateTime<Utc>,
}

/// In-memory vector index for semantic search.
///
/// Stores embeddings keyed by skill name, supporting:
/// - Upsert/remove operations
/// - Cosine similarity search over documents and chunks with threshold filtering
pub struct VectorIndex {
    entries: HashMap<String, VectorEntry>,
    /// Expected embedding dimensions
    dimensions: usize,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub skill_name: String,
    /// Best cosine similarity over the document and its chunks
    pub similarity: f32,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total chunk embeddings across all entries.
    pub fn chunk_count(&self) -> usize {
        self.entries.values().map(|entry| entry.chunks.len()).sum()
    }

    /// Insert or replace the entry for `embedding.skill_name`.
    ///
    /// Every vector (document and chunks) must match the index dimensions.
    pub fn upsert(&mut self, embedding: SkillEmbedding) -> Result<(), IndexError> {
        self.check_dimensions(&embedding.vector)?;
        for chunk in embedding.chunks.iter().flatten() {
            self.check_dimensions(&chunk.vector)?;
        }

        self.entries.insert(
            embedding.skill_name,
            VectorEntry {
                vector: embedding.vector,
                text_content: embedding.text_content,
                chunks: embedding.chunks.unwrap_or_default(),
                generated_at: embedding.generated_at,
            },
        );

        Ok(())
    }

    pub fn remove(&mut self, skill_name: &str) -> Option<VectorEntry> {
        self.entries.remove(skill_name)
    }

    pub fn get(&self, skill_name: &str) -> Option<&VectorEntry> {
        self.entries.get(skill_name)
    }

    pub fn contains(&self, skill_name: &str) -> bool {
        self.entries.contains_key(skill_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Search for similar vectors using cosine similarity.
    ///
    /// A skill scores the maximum similarity of its document vector and its
    /// chunk vectors. Results below `threshold` are dropped.
    ///
    /// # Returns
    /// At most `limit` results sorted by similarity (highest first). A
    /// zero-norm query matches nothing.
    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.check_dimensions(query)?;

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Ok(vec![]);
        }

        let mut results: Vec<SearchResult> = self
            .entries
            .iter()
            .filter_map(|(name, entry)| {
                let similarity = entry
                    .chunks
                    .iter()
                    .map(|chunk| Self::cosine_similarity(query, &chunk.vector, query_norm))
                    .fold(
                        Self::cosine_similarity(query, &entry.vector, query_norm),
                        f32::max,
                    );

                (similarity >= threshold).then(|| SearchResult {
                    skill_name: name.clone(),
                    similarity,
                })
            })
            .collect();

        // Sort by score descending; name breaks ties so results are stable
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.skill_name.cmp(&b.skill_name))
        });

        results.truncate(limit);

        Ok(results)
    }

    /// Rebuild a [`SkillEmbedding`] from a stored entry.
    pub fn to_embedding(&self, skill_name: &str) -> Option<SkillEmbedding> {
        self.entries.get(skill_name).map(|entry| SkillEmbedding {
            skill_name: skill_name.to_string(),
            vector: entry.vector.clone(),
            text_content: entry.text_content.clone(),
            chunks: (!entry.chunks.is_empty()).then(|| entry.chunks.clone()),
            generated_at: entry.generated_at,
        })
    }

    /// Bulk load entries into the index.
    /// Used when loading from storage.
    pub fn bulk_load(&mut self, embeddings: Vec<SkillEmbedding>) -> Result<(), IndexError> {
        for embedding in embeddings {
            self.upsert(embedding)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Compute cosine similarity between two vectors.
    /// Assumes query_norm is precomputed for efficiency.
    fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
        let target_norm = l2_norm(target);
        if target_norm < f32::EPSILON {
            return 0.0;
        }

        let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
        dot_product / (query_norm * target_norm)
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}
