use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MnemoConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub synthesis: SynthesisConfig,
    pub dedup: DedupConfig,
    pub relations: RelationsConfig,
    pub search: RetrievalConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"http"` (OpenAI-compatible endpoint) or `"hashed"` (offline, deterministic).
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    /// Name of the environment variable holding the API key, if any.
    pub api_key_env: String,
    pub dimensions: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SynthesisConfig {
    /// `"none"` disables answer synthesis, `"http"` uses a chat-completions endpoint.
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// How many top-ranked results are handed to the synthesizer.
    pub top_n: usize,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DedupConfig {
    pub url_window_secs: i64,
    pub url_jaccard_threshold: f64,
    pub confidence_boost: f64,
    pub importance_boost: f64,
    pub max_content_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelationsConfig {
    pub semantic_threshold: f64,
    pub topical_threshold: f64,
    pub temporal_threshold: f64,
    /// Pairs whose strongest edge is below this are dropped during shaping.
    pub min_strength: f64,
    pub mutual_k: usize,
    pub degree_cap: usize,
    /// Most recent memories per owner considered when rebuilding a graph.
    pub max_nodes: usize,
    /// Set when the embedding model only produces non-negative cosine values.
    pub embedding_space_nonnegative: bool,
    /// Multiplier applied to semantic scores involving a fallback vector.
    pub fallback_confidence: f64,
    pub topical: TopicalWeights,
    pub temporal: TemporalBands,
    pub domain: DomainRules,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TopicalWeights {
    pub topics: f64,
    pub categories: f64,
    pub key_points: f64,
    pub searchable_terms: f64,
    pub same_host_bonus: f64,
}

/// One decay band: applies while the time difference is at most `max_secs`,
/// scoring `base * exp(-delta / tau_secs)`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct DecayBand {
    pub max_secs: i64,
    pub base: f64,
    pub tau_secs: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TemporalBands {
    pub hour: DecayBand,
    pub day: DecayBand,
    pub week: DecayBand,
    pub month: DecayBand,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DomainRules {
    /// Raw semantic scores at or above this skip surface penalties.
    pub high_confidence: f64,
    pub penalties: Vec<SurfacePenalty>,
    pub boosts: Vec<SurfaceBoost>,
}

/// Two source surfaces whose captures look alike to embedding models but are
/// rarely related. Host patterns match the host itself or any subdomain.
#[derive(Debug, Deserialize, Clone)]
pub struct SurfacePenalty {
    pub name: String,
    pub left: Vec<String>,
    pub right: Vec<String>,
    pub multiplier: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SurfaceBoost {
    pub name: String,
    pub hosts: Vec<String>,
    pub keywords: Vec<String>,
    pub boost: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub min_keyword_score: f64,
    pub min_semantic_score: f64,
    /// Each index scan fetches `limit * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub job_status_ttl_secs: u64,
    pub cache_sweep_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_data_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashed".into(),
            model: "text-embedding-3-small".into(),
            endpoint: "http://localhost:11434/v1/embeddings".into(),
            api_key_env: "MNEMOGRAPH_API_KEY".into(),
            dimensions: crate::embedding::EMBEDDING_DIM,
            timeout_secs: 20,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: "none".into(),
            model: "gpt-4o-mini".into(),
            endpoint: "http://localhost:11434/v1/chat/completions".into(),
            api_key_env: "MNEMOGRAPH_API_KEY".into(),
            timeout_secs: 30,
            top_n: 5,
            cache_ttl_secs: 600,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            url_window_secs: 3600,
            url_jaccard_threshold: 0.9,
            confidence_boost: 0.1,
            importance_boost: 0.05,
            max_content_bytes: 100_000,
        }
    }
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: 0.30,
            topical_threshold: 0.25,
            temporal_threshold: 0.20,
            min_strength: 0.30,
            mutual_k: 3,
            degree_cap: 20,
            max_nodes: 500,
            embedding_space_nonnegative: false,
            fallback_confidence: 0.5,
            topical: TopicalWeights::default(),
            temporal: TemporalBands::default(),
            domain: DomainRules::default(),
        }
    }
}

impl Default for TopicalWeights {
    fn default() -> Self {
        Self {
            topics: 0.4,
            categories: 0.3,
            key_points: 0.2,
            searchable_terms: 0.1,
            same_host_bonus: 0.1,
        }
    }
}

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 24 * HOUR_SECS;

impl Default for TemporalBands {
    fn default() -> Self {
        Self {
            hour: DecayBand {
                max_secs: HOUR_SECS,
                base: 1.0,
                tau_secs: (2 * HOUR_SECS) as f64,
            },
            day: DecayBand {
                max_secs: DAY_SECS,
                base: 0.6,
                tau_secs: DAY_SECS as f64,
            },
            week: DecayBand {
                max_secs: 7 * DAY_SECS,
                base: 0.4,
                tau_secs: (7 * DAY_SECS) as f64,
            },
            month: DecayBand {
                max_secs: 30 * DAY_SECS,
                base: 0.2,
                tau_secs: (30 * DAY_SECS) as f64,
            },
        }
    }
}

impl Default for DomainRules {
    fn default() -> Self {
        let code_hosts = vec![
            "github.com".to_string(),
            "gitlab.com".to_string(),
            "bitbucket.org".to_string(),
        ];
        Self {
            high_confidence: 0.85,
            penalties: vec![SurfacePenalty {
                name: "meeting-vs-code".into(),
                left: vec![
                    "meet.google.com".into(),
                    "zoom.us".into(),
                    "teams.microsoft.com".into(),
                ],
                right: code_hosts.clone(),
                multiplier: 0.6,
            }],
            boosts: vec![SurfaceBoost {
                name: "code-hosting".into(),
                hosts: code_hosts,
                keywords: [
                    "pull request",
                    "commit",
                    "merge",
                    "branch",
                    "issue",
                    "repository",
                    "release",
                ]
                .iter()
                .map(|k| k.to_string())
                .collect(),
                boost: 0.05,
            }],
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            keyword_weight: 0.4,
            semantic_weight: 0.6,
            min_keyword_score: 0.05,
            min_semantic_score: 0.30,
            candidate_multiplier: 3,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            job_status_ttl_secs: 3600,
            cache_sweep_secs: 60,
        }
    }
}

impl RelationsConfig {
    /// Acceptance threshold for one relation type.
    pub fn threshold(&self, relation_type: crate::memory::types::RelationType) -> f64 {
        use crate::memory::types::RelationType;
        match relation_type {
            RelationType::Semantic => self.semantic_threshold,
            RelationType::Topical => self.topical_threshold,
            RelationType::Temporal => self.temporal_threshold,
        }
    }
}

/// Returns `~/.mnemograph/`
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mnemograph")
}

/// Returns the default config file path: `~/.mnemograph/config.toml`
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

impl MnemoConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemoConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MNEMOGRAPH_DB, MNEMOGRAPH_LOG_LEVEL, MNEMOGRAPH_EMBEDDING_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMOGRAPH_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMOGRAPH_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MNEMOGRAPH_EMBEDDING_URL") {
            self.embedding.endpoint = val;
            self.embedding.provider = "http".into();
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
