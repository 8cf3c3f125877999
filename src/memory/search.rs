use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::synthesis::{parse_citations, truncate_snippet, Snippet};

// ── Public types ──────────────────────────────────────────────────────────────

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub preview: String,
    /// Blended score in `[0.0, 1.0]`.
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) snippet_text: String,
}

/// A citation from the synthesized answer to a result position (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub position: usize,
    pub memory_id: String,
}

/// Ranked results with an optional synthesized answer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    /// Sub-steps that failed and were skipped (`"embedding"`, `"lexical"`,
    /// `"semantic"`, `"rows"`, `"synthesis"`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

/// Output of [`hybrid_search`] before synthesis.
#[derive(Debug, Default)]
pub struct Ranked {
    pub hits: Vec<SearchHit>,
    pub degraded: Vec<String>,
}

const PREVIEW_CHARS: usize = 200;
const SNIPPET_CHARS: usize = 600;

/// Query words too common to count as a keyword match.
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have", "he",
    "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not",
    "of", "on", "or", "our", "she", "so", "than", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "to", "too", "us", "was", "we", "were", "what", "when",
    "where", "which", "while", "who", "why", "will", "with", "would", "you", "your",
];

// ── Public API ────────────────────────────────────────────────────────────────

/// Hybrid search for one owner: FTS5 BM25 + vector KNN → noise floors →
/// blend → sort → truncate.
///
/// `query_embedding` is `None` when the query could not be embedded; ranking
/// then uses the lexical signal alone. A failing index scan is logged and
/// reported in [`Ranked::degraded`] instead of failing the search.
pub fn hybrid_search(
    conn: &Connection,
    owner_id: &str,
    query_text: &str,
    query_embedding: Option<&[f32]>,
    limit: usize,
    config: &RetrievalConfig,
) -> Result<Ranked> {
    let mut degraded = Vec::new();
    if limit == 0 {
        return Ok(Ranked::default());
    }
    let candidate_limit = limit.saturating_mul(config.candidate_multiplier.max(1));

    let lexical = match lexical_search(conn, owner_id, query_text, candidate_limit) {
        Ok(hits) => hits,
        Err(e) => {
            warn!(owner = owner_id, error = %e, "lexical search failed, continuing without it");
            degraded.push("lexical".to_string());
            Vec::new()
        }
    };

    let semantic = match query_embedding {
        Some(embedding) => match vector_search(conn, owner_id, embedding, candidate_limit) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(owner = owner_id, error = %e, "vector search failed, continuing without it");
                degraded.push("semantic".to_string());
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let mut signals: HashMap<String, (Option<f64>, Option<f64>)> = HashMap::new();
    for (id, score) in lexical {
        if score >= config.min_keyword_score {
            signals.entry(id).or_default().0 = Some(score);
        }
    }
    for (id, score) in semantic {
        if score >= config.min_semantic_score {
            signals.entry(id).or_default().1 = Some(score);
        }
    }

    let ids: Vec<&str> = signals.keys().map(String::as_str).collect();
    let rows = match fetch_rows(conn, owner_id, &ids) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(owner = owner_id, error = %e, "batch row fetch failed, resolving hits one by one");
            degraded.push("rows".to_string());
            fetch_rows_individually(conn, owner_id, &ids)
        }
    };

    let mut hits: Vec<SearchHit> = signals
        .iter()
        .filter_map(|(id, (keyword, semantic))| {
            let row = rows.get(id)?;
            let score = blend(*keyword, *semantic, config)?;
            Some(SearchHit {
                id: id.clone(),
                title: row.title.clone(),
                url: row.url.clone(),
                preview: truncate_snippet(&row.content, PREVIEW_CHARS),
                score,
                keyword_score: *keyword,
                semantic_score: *semantic,
                created_at: row.created_at,
                snippet_text: truncate_snippet(
                    row.summary.as_deref().unwrap_or(&row.content),
                    SNIPPET_CHARS,
                ),
            })
        })
        .collect();

    sort_hits(&mut hits);
    hits.truncate(limit);

    debug!(owner = owner_id, candidates = signals.len(), returned = hits.len(), "hybrid search");
    Ok(Ranked { hits, degraded })
}

/// Weighted blend when both signals are present, else whichever exists.
pub fn blend(keyword: Option<f64>, semantic: Option<f64>, config: &RetrievalConfig) -> Option<f64> {
    let score = match (keyword, semantic) {
        (Some(k), Some(s)) => config.keyword_weight * k + config.semantic_weight * s,
        (Some(k), None) => k,
        (None, Some(s)) => s,
        (None, None) => return None,
    };
    Some(score.clamp(0.0, 1.0))
}

/// Blended score descending, then more recent first, then id.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Numbered snippets for the top `top_n` hits.
pub fn snippets_for(hits: &[SearchHit], top_n: usize) -> Vec<Snippet> {
    hits.iter()
        .take(top_n)
        .enumerate()
        .map(|(i, hit)| Snippet {
            position: i + 1,
            memory_id: hit.id.clone(),
            title: hit.title.clone(),
            text: hit.snippet_text.clone(),
        })
        .collect()
}

/// Map `[n]` markers in a synthesized answer to cited results.
pub fn citations_for(answer: &str, snippets: &[Snippet]) -> Vec<Citation> {
    parse_citations(answer, snippets.len())
        .into_iter()
        .filter_map(|position| {
            snippets
                .iter()
                .find(|s| s.position == position)
                .map(|s| Citation {
                    position,
                    memory_id: s.memory_id.clone(),
                })
        })
        .collect()
}

/// FTS5 BM25 keyword search within one owner's memories.
///
/// Returns (id, score) with score in `(0, 1]`: the fraction of the query's
/// keywords the memory contains, scaled down by up to half for hits that
/// rank below the best one. A memory matching only stopwords never matches.
pub fn lexical_search(
    conn: &Connection,
    owner_id: &str,
    query_text: &str,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let terms = query_terms(query_text);
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    let escaped = escape_fts_query(&terms);

    let mut stmt = conn.prepare(
        "SELECT id, bm25(memories_fts) AS score, \
                coalesce(title, '') || ' ' || coalesce(summary, '') || ' ' || content \
         FROM memories_fts \
         WHERE memories_fts MATCH ?1 AND owner_id = ?2 ORDER BY score LIMIT ?3",
    )?;
    let raw = stmt
        .query_map(params![escaped, owner_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // FTS5 bm25 is negative (more negative = better).
    let best = raw.first().map(|(_, s, _)| *s).unwrap_or(0.0);
    Ok(raw
        .into_iter()
        .map(|(id, bm25, text)| {
            let relative = if best < 0.0 { (bm25 / best).clamp(0.0, 1.0) } else { 1.0 };
            let coverage = term_coverage(&terms, &text);
            (id, (coverage * (0.5 + 0.5 * relative)).clamp(0.0, 1.0))
        })
        .collect())
}

/// Vector KNN within the owner's partition of `memories_vec`.
///
/// Returns (id, score) with score = cosine similarity clamped to `[0, 1]`.
pub fn vector_search(
    conn: &Connection,
    owner_id: &str,
    embedding: &[f32],
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let embedding_bytes = super::embedding_to_bytes(embedding);
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM memories_vec \
         WHERE embedding MATCH ?1 AND k = ?2 AND owner_id = ?3 ORDER BY distance",
    )?;
    let results = stmt
        .query_map(params![embedding_bytes, limit as i64, owner_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results
        .into_iter()
        .map(|(id, distance)| (id, (1.0 - distance).clamp(0.0, 1.0)))
        .collect())
}

// ── Internal helpers ──────────────────────────────────────────────────────────

struct HitRow {
    title: Option<String>,
    url: Option<String>,
    summary: Option<String>,
    content: String,
    created_at: DateTime<Utc>,
}

/// Distinct lowercase word tokens of a query, stopwords removed, in first
/// occurrence order.
fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    word_tokens(query)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn word_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Fraction of `terms` present in `text`. FTS5 only returns rows matching at
/// least one term, so a returned row counts one match even when its
/// tokenizer folded a term differently.
fn term_coverage(terms: &[String], text: &str) -> f64 {
    let words: HashSet<String> = word_tokens(text).collect();
    let matched = terms.iter().filter(|t| words.contains(*t)).count().max(1);
    matched as f64 / terms.len() as f64
}

/// Quote each term for FTS5 MATCH syntax and join with `OR` so any matching
/// term contributes.
fn escape_fts_query(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Batch-fetch the display fields of the owner's memories by id.
fn fetch_rows(conn: &Connection, owner_id: &str, ids: &[&str]) -> Result<HashMap<String, HitRow>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (2..=ids.len() + 1).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, title, url, summary, content, created_at FROM memories \
         WHERE owner_id = ?1 AND id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&owner_id];
    params.extend(ids.iter().map(|id| id as &dyn rusqlite::types::ToSql));

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                HitRow {
                    title: row.get(1)?,
                    url: row.get(2)?,
                    summary: row.get(3)?,
                    content: row.get(4)?,
                    created_at: super::parse_timestamp(5, &row.get::<_, String>(5)?)?,
                },
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Fetch rows one at a time, skipping any that cannot be read.
fn fetch_rows_individually(conn: &Connection, owner_id: &str, ids: &[&str]) -> HashMap<String, HitRow> {
    let mut rows = HashMap::new();
    for id in ids {
        match fetch_rows(conn, owner_id, &[id]) {
            Ok(found) => rows.extend(found),
            Err(e) => warn!(memory_id = id, error = %e, "skipping unreadable search hit"),
        }
    }
    rows
}
