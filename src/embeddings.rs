// Embeddings Module - Pluggable embedding providers for semantic search
// The provider is an external contract: text in, fixed-dimension vector
// out. A deterministic local provider keeps the engine fully functional
// offline and in tests; provider outages degrade to marked fallback
// vectors instead of corrupting the index.

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::KgError;

/// Default embedding dimensionality.
pub const DEFAULT_DIMENSIONS: usize = 768;

/// Configuration for embedding providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_name: String,
    pub dimension: usize,
    pub max_batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_name: "hash-unit-v1".to_string(),
            dimension: DEFAULT_DIMENSIONS,
            max_batch_size: 32,
        }
    }
}

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model_used: String,
}

/// Trait for embedding providers
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding returned"))
    }

    /// Get the dimension of embeddings produced by this provider
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size
    fn max_batch_size(&self) -> usize;
}

/// Deterministic local provider: hashes the text into a unit vector.
///
/// Not a semantic model; it exists so the whole pipeline can run without a
/// network dependency, with stable outputs for identical inputs.
#[derive(Debug)]
pub struct HashEmbeddingProvider {
    config: EmbeddingConfig,
}

impl HashEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self::new(EmbeddingConfig {
            dimension: dimensions,
            ..Default::default()
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        if text.trim().is_empty() {
            return vec![0.0; self.config.dimension];
        }
        // Stretch the digest across the requested dimensionality by
        // re-hashing with a counter, then normalize to unit length.
        let mut values = Vec::with_capacity(self.config.dimension);
        let mut counter: u32 = 0;
        while values.len() < self.config.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if values.len() >= self.config.dimension {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map into [-1, 1]
                values.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        normalize(&mut values);
        values
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(EmbeddingConfig::default())
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.len() > self.config.max_batch_size {
            return Err(KgError::validation(
                "texts",
                format!(
                    "batch of {} exceeds provider maximum {}",
                    texts.len(),
                    self.config.max_batch_size
                ),
            )
            .into());
        }
        Ok(EmbeddingResult {
            embeddings: texts.iter().map(|t| self.embed_one(t)).collect(),
            model_used: self.config.model_name.clone(),
        })
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }
}

/// Fallback vector used when the provider is unavailable: a zero vector for
/// empty content, otherwise a random unit vector. Callers mark these with
/// `source: "fallback"` metadata so they can be regenerated later.
pub fn fallback_vector(content: &str, dimensions: usize) -> Vec<f32> {
    if content.trim().is_empty() {
        return vec![0.0; dimensions];
    }
    let mut rng = rand::thread_rng();
    let mut values: Vec<f32> = (0..dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect();
    normalize(&mut values);
    values
}

fn normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_provider_is_deterministic() -> Result<()> {
        let provider = HashEmbeddingProvider::with_dimensions(64);
        let a = provider.embed_text("fn login()").await?;
        let b = provider.embed_text("fn login()").await?;
        assert_eq!(a, b);
        let c = provider.embed_text("fn logout()").await?;
        assert_ne!(a, c);
        Ok(())
    }

    #[tokio::test]
    async fn vectors_are_unit_length() -> Result<()> {
        let provider = HashEmbeddingProvider::with_dimensions(128);
        let v = provider.embed_text("some content").await?;
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() -> Result<()> {
        let provider = HashEmbeddingProvider::with_dimensions(16);
        let v = provider.embed_text("   ").await?;
        assert!(v.iter().all(|x| *x == 0.0));
        Ok(())
    }

    #[test]
    fn fallback_vector_is_zero_for_empty_and_unit_otherwise() {
        let zero = fallback_vector("", 8);
        assert!(zero.iter().all(|x| *x == 0.0));

        let random = fallback_vector("content", 8);
        let norm: f32 = random.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected() {
        let provider = HashEmbeddingProvider::new(EmbeddingConfig {
            max_batch_size: 2,
            ..Default::default()
        });
        let texts: Vec<String> = (0..3).map(|i| format!("text {i}")).collect();
        assert!(provider.embed_texts(&texts).await.is_err());
    }
}
