//! Local feature-hashing embedder
//!
//! Lowercased word unigrams and bigrams are hashed into signed buckets and the
//! result is L2-normalised. No model download, no network, stable across runs
//! and platforms, so vectors can be persisted next to their entries.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Embedder;
use crate::error::{CacheError, Result};

const DEFAULT_DIMENSIONS: usize = 256;
const BIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(CacheError::validation("embedding dimensions must be > 0"));
        }
        Ok(Self { dimensions })
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(bytes);

        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    /// Synchronous core of [`Embedder::embed`]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            self.add_feature(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, &bigram, BIGRAM_WEIGHT);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}
