//! Chat-completions answer synthesizer (OpenAI-compatible wire format).

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{build_prompt, AnswerSynthesizer, Snippet};
use crate::config::SynthesisConfig;

const SYSTEM_PROMPT: &str = "You answer questions about a user's saved notes. \
Be brief and factual, and never cite a source number that was not provided.";

pub struct HttpSynthesizer {
    /// Built on first use: a blocking client must not be created on an
    /// async worker thread.
    client: OnceLock<reqwest::blocking::Client>,
    timeout: Duration,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.endpoint.is_empty(),
            "synthesis.endpoint must be set for the http provider"
        );
        Ok(Self {
            client: OnceLock::new(),
            timeout: Duration::from_secs(config.timeout_secs),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
        })
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("failed to build synthesis HTTP client")?;
        Ok(self.client.get_or_init(|| built))
    }
}

impl AnswerSynthesizer for HttpSynthesizer {
    fn synthesize(&self, query: &str, snippets: &[Snippet]) -> Result<String> {
        let prompt = build_prompt(query, snippets);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.2,
        };

        let mut request = self.client()?.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .with_context(|| format!("synthesis request to {} failed", self.endpoint))?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "synthesis API error {status}");

        let parsed: ChatResponse = response
            .json()
            .context("failed to decode synthesis response")?;

        let answer = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        anyhow::ensure!(!answer.is_empty(), "synthesis returned an empty answer");
        Ok(answer)
    }
}
