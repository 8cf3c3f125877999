//! Ingestion-time duplicate detection and merge.
//!
//! Two checks, cheapest first: an exact canonical-hash lookup, then a
//! time-boxed scan of the owner's recent captures of the same normalized URL
//! compared by word-set Jaccard similarity.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::canonical::{normalize_url, word_jaccard};
use super::format_timestamp;
use super::store::write_audit_log;
use super::types::MemoryMetadata;
use crate::config::DedupConfig;

/// Why an incoming memory was considered a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    /// Identical canonical hash.
    Canonical,
    /// Same normalized URL inside the recapture window with near-identical text.
    Url,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canonical => "canonical",
            Self::Url => "url",
        }
    }
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Duplicate {
    pub memory_id: String,
    pub reason: DuplicateReason,
}

/// Look for an existing memory of `owner_id` that the incoming capture
/// duplicates. `url` should already be cleaned of the `"unknown"` sentinel.
pub fn find_duplicate(
    conn: &Connection,
    owner_id: &str,
    canonical_text: &str,
    canonical_hash: &str,
    url: Option<&str>,
    now: DateTime<Utc>,
    cfg: &DedupConfig,
) -> Result<Option<Duplicate>> {
    let exact: Option<String> = conn
        .query_row(
            "SELECT id FROM memories WHERE owner_id = ?1 AND canonical_hash = ?2",
            params![owner_id, canonical_hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(memory_id) = exact {
        return Ok(Some(Duplicate {
            memory_id,
            reason: DuplicateReason::Canonical,
        }));
    }

    let Some(normalized) = url.and_then(normalize_url) else {
        return Ok(None);
    };

    let since = format_timestamp(now - Duration::seconds(cfg.url_window_secs));
    let mut stmt = conn.prepare(
        "SELECT id, canonical_text FROM memories \
         WHERE owner_id = ?1 AND normalized_url = ?2 AND created_at >= ?3 \
         ORDER BY created_at DESC, id DESC",
    )?;
    let candidates = stmt
        .query_map(params![owner_id, normalized, since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (memory_id, existing_text) in candidates {
        let similarity = word_jaccard(canonical_text, &existing_text);
        debug!(%memory_id, similarity, "url recapture candidate");
        if similarity >= cfg.url_jaccard_threshold {
            return Ok(Some(Duplicate {
                memory_id,
                reason: DuplicateReason::Url,
            }));
        }
    }

    Ok(None)
}

/// Fold an incoming duplicate's signal into the existing memory: bounded
/// confidence and importance boosts, one more access, metadata union.
pub fn merge_duplicate(
    conn: &Connection,
    memory_id: &str,
    incoming: &MemoryMetadata,
    cfg: &DedupConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    let raw: String = conn.query_row(
        "SELECT metadata FROM memories WHERE id = ?1",
        [memory_id],
        |row| row.get(0),
    )?;
    let mut metadata: MemoryMetadata = serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!(%memory_id, error = %e, "stored metadata unreadable, replacing");
        MemoryMetadata::default()
    });

    metadata.merge_from(incoming);
    if let Some(importance) = metadata.importance {
        metadata.importance = Some((importance + cfg.importance_boost).min(1.0));
    }

    conn.execute(
        "UPDATE memories SET metadata = ?1, \
         confidence = MIN(confidence + ?2, 1.0), \
         access_count = access_count + 1, \
         updated_at = ?3 \
         WHERE id = ?4",
        params![
            serde_json::to_string(&metadata)?,
            cfg.confidence_boost,
            format_timestamp(now),
            memory_id,
        ],
    )?;

    write_audit_log(
        conn,
        "merge",
        memory_id,
        Some(&serde_json::json!({ "confidence_boost": cfg.confidence_boost })),
    )?;
    Ok(())
}
