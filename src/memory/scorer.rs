//! Pairwise relation scoring.
//!
//! Three independent signals per pair of memories: semantic (embedding
//! cosine with domain adjustments), topical (weighted facet overlap) and
//! temporal (banded exponential decay). Each is in `[0.0, 1.0]` or `None`
//! when the signal is missing on either side. All scores are commutative.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::trace;

use super::canonical::{host_matches, url_host};
use super::cosine_similarity;
use super::types::{Embedding, Memory, RelationEdge, RelationType};
use crate::config::{DomainRules, RelationsConfig, TemporalBands, TopicalWeights};

/// A memory plus the signals scoring needs, computed once per rebuild.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub memory: Memory,
    /// Stored `content` embedding, if enrichment has produced one.
    pub embedding: Option<Embedding>,
    host: Option<String>,
    /// Canonical text with punctuation flattened, padded for phrase lookup.
    phrase_text: String,
}

impl GraphNode {
    pub fn new(memory: Memory, embedding: Option<Embedding>) -> Self {
        let host = memory.url.as_deref().and_then(url_host);
        let phrase_text = format!(" {} ", flatten_words(&memory.canonical_text));
        Self {
            memory,
            embedding,
            host,
            phrase_text,
        }
    }

    pub fn id(&self) -> &str {
        &self.memory.id
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn mentions(&self, keyword: &str) -> bool {
        let keyword = flatten_words(&keyword.to_lowercase());
        !keyword.is_empty() && self.phrase_text.contains(&format!(" {keyword} "))
    }
}

fn flatten_words(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The three signals for one pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PairScores {
    pub semantic: Option<f64>,
    pub topical: Option<f64>,
    pub temporal: Option<f64>,
}

impl PairScores {
    pub fn get(&self, relation_type: RelationType) -> Option<f64> {
        match relation_type {
            RelationType::Semantic => self.semantic,
            RelationType::Topical => self.topical,
            RelationType::Temporal => self.temporal,
        }
    }

    /// Signals at or above their type's acceptance threshold.
    pub fn accepted(&self, cfg: &RelationsConfig) -> Vec<(RelationType, f64)> {
        RelationType::ALL
            .into_iter()
            .filter_map(|t| self.get(t).map(|score| (t, score)))
            .filter(|(t, score)| *score >= cfg.threshold(*t))
            .collect()
    }
}

pub fn score_pair(a: &GraphNode, b: &GraphNode, cfg: &RelationsConfig) -> PairScores {
    PairScores {
        semantic: semantic_score(a, b, cfg),
        topical: topical_score(a, b, &cfg.topical),
        temporal: Some(temporal_score(
            a.memory.created_at,
            b.memory.created_at,
            &cfg.temporal,
        )),
    }
}

/// Cosine of the `content` embeddings mapped to `[0, 1]`, discounted for
/// fallback vectors, then adjusted by the domain rule table.
///
/// Only vectors of the same model and dimension are compared. Fallback
/// vectors carry the hashed model key, so a memory whose embedding fell back
/// gets no semantic score against primary-model peers, and
/// `fallback_confidence` in practice applies between two fallback vectors.
pub fn semantic_score(a: &GraphNode, b: &GraphNode, cfg: &RelationsConfig) -> Option<f64> {
    let (ea, eb) = (a.embedding.as_ref()?, b.embedding.as_ref()?);
    if ea.model != eb.model || ea.vector.len() != eb.vector.len() || ea.vector.is_empty() {
        return None;
    }

    let cos = cosine_similarity(&ea.vector, &eb.vector);
    let mut score = if cfg.embedding_space_nonnegative {
        cos.clamp(0.0, 1.0)
    } else {
        (cos + 1.0) / 2.0
    };
    if ea.fallback || eb.fallback {
        score *= cfg.fallback_confidence;
    }

    Some(apply_domain_rules(score, a, b, &cfg.domain).clamp(0.0, 1.0))
}

fn apply_domain_rules(raw: f64, a: &GraphNode, b: &GraphNode, rules: &DomainRules) -> f64 {
    let (Some(host_a), Some(host_b)) = (a.host(), b.host()) else {
        return raw;
    };
    let on = |host: &str, patterns: &[String]| patterns.iter().any(|p| host_matches(host, p));

    let mut score = raw;
    if raw < rules.high_confidence {
        for penalty in &rules.penalties {
            let crossed = (on(host_a, &penalty.left) && on(host_b, &penalty.right))
                || (on(host_a, &penalty.right) && on(host_b, &penalty.left));
            if crossed {
                trace!(rule = %penalty.name, host_a, host_b, "surface penalty");
                score *= penalty.multiplier;
            }
        }
    }

    for boost in &rules.boosts {
        if on(host_a, &boost.hosts)
            && on(host_b, &boost.hosts)
            && boost.keywords.iter().any(|k| a.mentions(k) && b.mentions(k))
        {
            trace!(rule = %boost.name, host_a, host_b, "surface boost");
            score += boost.boost;
        }
    }

    score.min(1.0)
}

/// Weighted facet overlap plus a same-host bonus. `None` when either side
/// has no facets at all.
pub fn topical_score(a: &GraphNode, b: &GraphNode, weights: &TopicalWeights) -> Option<f64> {
    let (ma, mb) = (&a.memory.metadata, &b.memory.metadata);
    if !ma.has_facets() || !mb.has_facets() {
        return None;
    }

    let mut score = weights.topics * set_jaccard(&ma.topics, &mb.topics)
        + weights.categories * set_jaccard(&ma.categories, &mb.categories)
        + weights.key_points * set_jaccard(&ma.key_point_set(), &mb.key_point_set())
        + weights.searchable_terms * set_jaccard(&ma.searchable_terms, &mb.searchable_terms);

    if matches!((a.host(), b.host()), (Some(x), Some(y)) if x == y) {
        score += weights.same_host_bonus;
    }

    Some(score.min(1.0))
}

fn set_jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Banded exponential decay of the absolute time difference; 0 past the
/// last band.
pub fn temporal_score(a: DateTime<Utc>, b: DateTime<Utc>, bands: &TemporalBands) -> f64 {
    let delta_secs = (a - b).num_milliseconds().unsigned_abs() as f64 / 1000.0;
    for band in [bands.hour, bands.day, bands.week, bands.month] {
        if delta_secs <= band.max_secs as f64 {
            return (band.base * (-delta_secs / band.tau_secs).exp()).clamp(0.0, 1.0);
        }
    }
    0.0
}

/// Accepted edges from `subject` to each peer, one per accepted type.
pub fn candidate_edges<'a>(
    subject: &GraphNode,
    peers: impl IntoIterator<Item = &'a GraphNode>,
    cfg: &RelationsConfig,
    now: DateTime<Utc>,
) -> Vec<RelationEdge> {
    let mut edges = Vec::new();
    for peer in peers {
        if peer.id() == subject.id() || peer.memory.owner_id != subject.memory.owner_id {
            continue;
        }
        for (relation_type, score) in score_pair(subject, peer, cfg).accepted(cfg) {
            edges.push(RelationEdge {
                owner_id: subject.memory.owner_id.clone(),
                source_id: subject.id().to_string(),
                target_id: peer.id().to_string(),
                relation_type,
                score,
                created_at: now,
            });
        }
    }
    edges
}

/// Score every unordered pair exactly once; the source of each edge is the
/// lexicographically smaller id.
pub fn score_owner(nodes: &[GraphNode], cfg: &RelationsConfig, now: DateTime<Utc>) -> Vec<RelationEdge> {
    let mut sorted: Vec<&GraphNode> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.id().cmp(b.id()));
    sorted.dedup_by(|a, b| a.id() == b.id());

    let mut edges = Vec::new();
    for (i, subject) in sorted.iter().enumerate() {
        edges.extend(candidate_edges(subject, sorted[i + 1..].iter().copied(), cfg, now));
    }
    edges
}
