//! OpenAI-compatible HTTP embedding provider.
//!
//! Posts `{"model", "input", "dimensions"}` to the configured `/embeddings`
//! endpoint and reads `data[0].embedding`. Uses the blocking `reqwest` client,
//! so it must be called from a blocking context. The client itself is built
//! on first use for the same reason.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{l2_normalize, EmbeddingProvider};
use crate::config::EmbeddingConfig;

pub struct HttpEmbeddingProvider {
    client: OnceLock<reqwest::blocking::Client>,
    timeout: Duration,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.endpoint.is_empty(),
            "embedding.endpoint must be set for the http provider"
        );

        let api_key = std::env::var(&config.api_key_env).ok();
        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            authenticated = api_key.is_some(),
            "HTTP embedding provider ready"
        );

        Ok(Self {
            client: OnceLock::new(),
            timeout: Duration::from_secs(config.timeout_secs),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            dimensions: config.dimensions,
        })
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(self.client.get_or_init(|| built))
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: self.dimensions,
        };

        let mut request = self.client()?.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .with_context(|| format!("embedding request to {} failed", self.endpoint))?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "embedding API error {status}");

        let parsed: EmbeddingResponse = response
            .json()
            .context("failed to decode embedding response")?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("embedding response contained no data")?;

        anyhow::ensure!(
            vector.len() == self.dimensions,
            "embedding has {} dimensions, expected {}",
            vector.len(),
            self.dimensions
        );

        Ok(l2_normalize(&vector))
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
