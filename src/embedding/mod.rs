//! Text-to-vector embedding gateway.
//!
//! Provides the [`EmbeddingProvider`] trait, an OpenAI-compatible HTTP
//! implementation, and a deterministic hashed bag-of-words embedder that also
//! serves as the fallback when the configured provider fails. Providers are
//! created via [`create_provider`] from configuration and wrapped in a
//! [`FallbackEmbedder`] so ingestion always gets a vector back.

pub mod hashed;
pub mod http;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use hashed::{FallbackEmbedder, HashedEmbedder};

/// Number of dimensions in the embedding vectors.
pub const EMBEDDING_DIM: usize = 768;

/// Which text of a memory a vector was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingType {
    Content,
    Summary,
    Title,
}

impl EmbeddingType {
    pub const ALL: [EmbeddingType; 3] = [Self::Content, Self::Summary, Self::Title];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Summary => "summary",
            Self::Title => "title",
        }
    }
}

impl std::fmt::Display for EmbeddingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmbeddingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(Self::Content),
            "summary" => Ok(Self::Summary),
            "title" => Ok(Self::Title),
            _ => Err(format!("unknown embedding type: {s}")),
        }
    }
}

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly
/// [`dimensions`](EmbeddingProvider::dimensions) entries. All methods are
/// synchronous: callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Model identifier stored alongside every vector this provider produces.
    fn model(&self) -> &str;

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Create an embedding provider from config.
///
/// `"http"` talks to an OpenAI-compatible `/embeddings` endpoint; `"hashed"`
/// runs fully offline.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "http" => {
            let provider = http::HttpEmbeddingProvider::new(config)?;
            Ok(Arc::new(provider))
        }
        "hashed" => Ok(Arc::new(HashedEmbedder::new(config.dimensions))),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: http, hashed"),
    }
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub(crate) fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let v = vec![3.0, 4.0];
        let normalized = l2_normalize(&v);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
        let norm: f32 = normalized.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let v = vec![0.0, 0.0, 0.0];
        let normalized = l2_normalize(&v);
        assert_eq!(normalized, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn create_provider_rejects_unknown() {
        let config = crate::config::EmbeddingConfig {
            provider: "onnx".into(),
            ..Default::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("unknown embedding provider"));
    }

    #[test]
    fn create_provider_hashed() {
        let config = crate::config::EmbeddingConfig::default();
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.dimensions(), EMBEDDING_DIM);
        assert_eq!(provider.embed("hello world").unwrap().len(), EMBEDDING_DIM);
    }
}
