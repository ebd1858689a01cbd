//! Deterministic hashing embedder.
//!
//! Projects lowercase tokens and adjacent-token bigrams onto a fixed number
//! of signed buckets with FNV-1a, then L2-normalizes. No model files, no
//! network; texts sharing vocabulary land close together.

use crate::semantic::embeddings::{l2_norm, EmbeddingError, TextEmbedder};

/// Buckets each feature is spread over.
const PROBES: u64 = 4;

const BIGRAM_WEIGHT: f32 = 0.5;

pub struct HashEmbedder {
    dimensions: usize,
    name: String,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            name: format!("hash-fnv1a-{}", dimensions),
        }
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let seed = fnv1a(feature.as_bytes());
        for probe in 0..PROBES {
            let mut bytes = [0u8; 16];
            bytes[..8].copy_from_slice(&seed.to_le_bytes());
            bytes[8..].copy_from_slice(&probe.to_le_bytes());
            let hash = fnv1a(&bytes);

            let bucket = ((hash >> 1) % self.dimensions as u64) as usize;
            if hash & 1 == 0 {
                vector[bucket] += weight;
            } else {
                vector[bucket] -= weight;
            }
        }
    }
}

impl TextEmbedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0; self.dimensions];
        if self.dimensions == 0 {
            return Ok(vector);
        }

        let tokens = tokenize(text);
        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }

        let norm = l2_norm(&vector);
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

fn fnv1a(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    data.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ *byte as u64).wrapping_mul(FNV_PRIME)
    })
}
