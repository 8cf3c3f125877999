//! Core record type definitions.
//!
//! Defines [`Memory`] (a captured record), [`MemoryMetadata`] (the structured
//! facets attached by enrichment), [`Embedding`] (a stored vector), and
//! [`RelationEdge`] (a scored, typed link between two memories of one owner).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingType;

/// Source URL sentinel meaning "captured from somewhere we could not identify".
pub const UNKNOWN_URL: &str = "unknown";

/// Upper bound on keys in [`MemoryMetadata::extra`].
pub const MAX_EXTRA_KEYS: usize = 16;
/// Upper bound on the length of a single [`MemoryMetadata::extra`] key.
pub const MAX_EXTRA_KEY_LEN: usize = 64;

/// Overall tone of a memory as labelled by enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
            Self::Mixed => "mixed",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            "mixed" => Ok(Self::Mixed),
            _ => Err(format!("unknown sentiment: {s}")),
        }
    }
}

/// Structured metadata facets. Every facet is optional; scoring code reads the
/// named facets and never looks inside `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryMetadata {
    pub topics: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    /// Ordered, as produced by the summarizer.
    pub key_points: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    /// Importance/usefulness in `[0.0, 1.0]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    pub searchable_terms: BTreeSet<String>,
    /// Bounded free-form extension map (see [`MAX_EXTRA_KEYS`]).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MemoryMetadata {
    /// Trim and lowercase set facets, drop blanks, de-duplicate key points
    /// (case-insensitively, first occurrence wins) and clamp importance.
    pub fn normalized(self) -> Self {
        fn clean_set(set: BTreeSet<String>) -> BTreeSet<String> {
            set.into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        }

        let mut seen = BTreeSet::new();
        let key_points = self
            .key_points
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && seen.insert(p.to_lowercase()))
            .collect();

        Self {
            topics: clean_set(self.topics),
            categories: clean_set(self.categories),
            key_points,
            sentiment: self.sentiment,
            importance: self.importance.map(|i| i.clamp(0.0, 1.0)),
            searchable_terms: clean_set(self.searchable_terms),
            extra: self.extra,
        }
    }

    /// Check the bounds that deserialization alone cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.extra.len() > MAX_EXTRA_KEYS {
            return Err(format!(
                "extra has {} keys, maximum is {MAX_EXTRA_KEYS}",
                self.extra.len()
            ));
        }
        if let Some(key) = self.extra.keys().find(|k| k.len() > MAX_EXTRA_KEY_LEN) {
            return Err(format!(
                "extra key '{key}' is longer than {MAX_EXTRA_KEY_LEN} characters"
            ));
        }
        if let Some(importance) = self.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err("importance must be between 0.0 and 1.0".into());
            }
        }
        Ok(())
    }

    /// True when at least one facet used for topical scoring is non-empty.
    pub fn has_facets(&self) -> bool {
        !self.topics.is_empty()
            || !self.categories.is_empty()
            || !self.key_points.is_empty()
            || !self.searchable_terms.is_empty()
    }

    /// Key points lowercased for set comparison.
    pub fn key_point_set(&self) -> BTreeSet<String> {
        self.key_points.iter().map(|p| p.to_lowercase()).collect()
    }

    /// Fold another memory's metadata into this one. Applying the same
    /// `other` twice leaves the result unchanged.
    pub fn merge_from(&mut self, other: &MemoryMetadata) {
        self.topics.extend(other.topics.iter().cloned());
        self.categories.extend(other.categories.iter().cloned());
        self.searchable_terms
            .extend(other.searchable_terms.iter().cloned());

        let known = self.key_point_set();
        for point in &other.key_points {
            if !known.contains(&point.to_lowercase()) {
                self.key_points.push(point.clone());
            }
        }

        if self.sentiment.is_none() {
            self.sentiment = other.sentiment;
        }
        if self.importance.is_none() {
            self.importance = other.importance;
        }

        for (key, value) in &other.extra {
            if self.extra.len() >= MAX_EXTRA_KEYS {
                break;
            }
            self.extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub owner_id: String,
    /// Raw captured content, as submitted.
    pub content: String,
    pub canonical_text: String,
    /// Lowercase hex SHA-256 of `canonical_text`.
    pub canonical_hash: String,
    /// Source URL; `None` when absent or the `"unknown"` sentinel.
    pub url: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub metadata: MemoryMetadata,
    /// Confidence in `[0.0, 1.0]`, bumped by duplicate merges.
    pub confidence: f64,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub memory_id: String,
    pub embedding_type: EmbeddingType,
    /// Model identifier; vectors from different models are never compared.
    pub model: String,
    pub vector: Vec<f32>,
    /// `true` when produced by the deterministic fallback embedder.
    pub fallback: bool,
}

/// The three independent similarity signals between two memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Semantic,
    Topical,
    Temporal,
}

impl RelationType {
    pub const ALL: [RelationType; 3] = [Self::Semantic, Self::Topical, Self::Temporal];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Topical => "topical",
            Self::Temporal => "temporal",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(Self::Semantic),
            "topical" => Ok(Self::Topical),
            "temporal" => Ok(Self::Temporal),
            _ => Err(format!("unknown relation type: {s}")),
        }
    }
}

/// A directed, typed, scored link between two memories of the same owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEdge {
    pub owner_id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation_type: RelationType,
    /// Score in `[0.0, 1.0]`.
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl RelationEdge {
    /// The unordered endpoint pair, smaller id first.
    pub fn pair(&self) -> (&str, &str) {
        if self.source_id <= self.target_id {
            (&self.source_id, &self.target_id)
        } else {
            (&self.target_id, &self.source_id)
        }
    }
}
