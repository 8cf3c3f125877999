//! Deterministic hashed bag-of-words embeddings and the fallback wrapper.
//!
//! [`HashedEmbedder`] maps each lowercase word to a bucket and sign derived
//! from its SHA-256 digest, so texts sharing vocabulary land near each other
//! without any model. [`FallbackEmbedder`] uses it whenever the primary
//! provider errors or returns a vector of the wrong size.

use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingProvider, EmbeddingType};

/// Model identifier recorded for hashed vectors.
pub const HASHED_MODEL: &str = "hashed-bow-v1";

/// Offline embedder: signed feature hashing over word tokens.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimensions: usize,
}

impl HashedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Compute the vector for `text`. Never fails, never all-zero.
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let mut tokens = 0usize;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            self.accumulate(&mut v, token.as_bytes());
            tokens += 1;
        }

        // No word tokens (empty or punctuation-only): hash the raw text so the
        // result is still a stable unit vector.
        if tokens == 0 {
            self.accumulate(&mut v, text.as_bytes());
        }

        l2_normalize(&v)
    }

    fn accumulate(&self, v: &mut [f32], bytes: &[u8]) {
        let digest = Sha256::digest(bytes);
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign;
    }
}

impl EmbeddingProvider for HashedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    fn model(&self) -> &str {
        HASHED_MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// A vector plus the provenance needed to store it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedVector {
    pub vector: Vec<f32>,
    pub model: String,
    pub fallback: bool,
}

/// Wraps the configured provider so that embedding never fails: on error the
/// hashed vector is returned and flagged as a lower-confidence fallback.
pub struct FallbackEmbedder {
    primary: Arc<dyn EmbeddingProvider>,
    fallback: HashedEmbedder,
}

impl FallbackEmbedder {
    pub fn new(primary: Arc<dyn EmbeddingProvider>) -> Self {
        let fallback = HashedEmbedder::new(primary.dimensions());
        Self { primary, fallback }
    }

    /// The wrapped provider, for callers that prefer an error over a fallback
    /// (query embedding in search).
    pub fn primary(&self) -> &dyn EmbeddingProvider {
        self.primary.as_ref()
    }

    /// Model identifier of the primary provider.
    pub fn model(&self) -> &str {
        self.primary.model()
    }

    pub fn embed(&self, text: &str, kind: EmbeddingType) -> EmbeddedVector {
        let expected = self.primary.dimensions();
        match self.primary.embed(text) {
            Ok(vector) if vector.len() == expected => EmbeddedVector {
                vector,
                model: self.primary.model().to_string(),
                fallback: false,
            },
            Ok(vector) => {
                tracing::warn!(
                    kind = %kind,
                    got = vector.len(),
                    expected,
                    "embedding dimension mismatch, using hashed fallback"
                );
                self.fallback_vector(text)
            }
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "embedding failed, using hashed fallback");
                self.fallback_vector(text)
            }
        }
    }

    fn fallback_vector(&self, text: &str) -> EmbeddedVector {
        EmbeddedVector {
            vector: self.fallback.vector(text),
            model: HASHED_MODEL.to_string(),
            fallback: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EMBEDDING_DIM;
    use crate::memory::cosine_similarity;

    struct FailingProvider;

    impl EmbeddingProvider for FailingProvider {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            anyhow::bail!("503 Service Unavailable")
        }

        fn model(&self) -> &str {
            "remote-model"
        }
    }

    struct ShortProvider;

    impl EmbeddingProvider for ShortProvider {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0; 12])
        }

        fn model(&self) -> &str {
            "short-model"
        }
    }

    #[test]
    fn hashed_vectors_are_deterministic_and_normalized() {
        let embedder = HashedEmbedder::new(EMBEDDING_DIM);
        let a = embedder.vector("The quick brown fox");
        let b = embedder.vector("The quick brown fox");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashed_vectors_reflect_shared_vocabulary() {
        let embedder = HashedEmbedder::new(EMBEDDING_DIM);
        let a = embedder.vector("rust async runtime tokio scheduler");
        let b = embedder.vector("tokio runtime scheduler for async rust");
        let c = embedder.vector("banana bread recipe with walnuts");
        let close = cosine_similarity(&a, &b);
        let far = cosine_similarity(&a, &c);
        assert!(close > 0.8, "shared words should be close, got {close}");
        assert!(far < close);
    }

    #[test]
    fn empty_text_still_yields_unit_vector() {
        let embedder = HashedEmbedder::new(EMBEDDING_DIM);
        let v = embedder.vector("");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn fallback_on_provider_error() {
        let embedder = FallbackEmbedder::new(Arc::new(FailingProvider));
        let out = embedder.embed("some text", EmbeddingType::Content);
        assert!(out.fallback);
        assert_eq!(out.model, HASHED_MODEL);
        assert_eq!(out.vector.len(), EMBEDDING_DIM);
        assert_eq!(out, embedder.embed("some text", EmbeddingType::Content));
    }

    #[test]
    fn fallback_on_dimension_mismatch() {
        let embedder = FallbackEmbedder::new(Arc::new(ShortProvider));
        let out = embedder.embed("some text", EmbeddingType::Title);
        assert!(out.fallback);
        assert_eq!(out.vector.len(), EMBEDDING_DIM);
    }

    #[test]
    fn primary_success_is_not_flagged() {
        let embedder = FallbackEmbedder::new(Arc::new(HashedEmbedder::new(EMBEDDING_DIM)));
        let out = embedder.embed("some text", EmbeddingType::Content);
        assert!(!out.fallback);
        assert_eq!(out.model, HASHED_MODEL);
    }
}
