//! Write path and record access: ingestion, owner registry, summaries,
//! embeddings and audit logging.
//!
//! [`ingest_memory`] is the single entry point for new content. It runs inside
//! a transaction: validate, canonicalize, duplicate gate (merge and stop on a
//! hit), insert into `memories`, sync the FTS5 index, write an audit log.
//! Embeddings arrive later through [`append_embedding`].

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::canonical::{canonical_hash, canonicalize, clean_url, normalize_url};
use super::dedup::{find_duplicate, merge_duplicate, DuplicateReason};
use super::types::{Embedding, Memory, MemoryMetadata};
use super::{bytes_to_embedding, embedding_to_bytes, format_timestamp, parse_timestamp};
use crate::config::DedupConfig;
use crate::embedding::{EmbeddingType, EMBEDDING_DIM};

/// Confidence assigned to a freshly captured memory; duplicate merges raise it.
pub const INITIAL_CONFIDENCE: f64 = 0.5;

const MEMORY_COLUMNS: &str = "id, owner_id, content, canonical_text, canonical_hash, url, \
     title, summary, metadata, confidence, access_count, created_at, updated_at";

/// Reasons an ingestion request is rejected.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("content is empty")]
    EmptyContent,
    #[error("content is {size} bytes, maximum is {max}")]
    ContentTooLarge { size: usize, max: usize },
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("unknown owner: {0}")]
    UnknownOwner(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl IngestError {
    /// Stable machine-readable reason string.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::EmptyContent => "empty_content",
            Self::ContentTooLarge { .. } => "content_too_large",
            Self::InvalidMetadata(_) => "invalid_metadata",
            Self::UnknownOwner(_) => "unknown_owner",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.into())
    }
}

/// An ingestion request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMemory {
    pub content: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: MemoryMetadata,
}

/// Result of an ingestion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Created { id: String },
    Duplicate { id: String, reason: DuplicateReason },
}

impl IngestOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Created { id } | Self::Duplicate { id, .. } => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Full write path: validate → canonicalize → dedup gate → insert → FTS sync → audit log.
pub fn ingest_memory(
    conn: &mut Connection,
    owner_id: &str,
    new: NewMemory,
    cfg: &DedupConfig,
    now: DateTime<Utc>,
) -> Result<IngestOutcome, IngestError> {
    if new.content.trim().is_empty() {
        return Err(IngestError::EmptyContent);
    }
    if new.content.len() > cfg.max_content_bytes {
        return Err(IngestError::ContentTooLarge {
            size: new.content.len(),
            max: cfg.max_content_bytes,
        });
    }
    let metadata = new.metadata.normalized();
    metadata.validate().map_err(IngestError::InvalidMetadata)?;

    let canonical_text = canonicalize(&new.content);
    let hash = canonical_hash(&canonical_text);
    let url = clean_url(new.url.as_deref());
    let title = new
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let tx = conn.transaction()?;

    if !owner_exists(&tx, owner_id)? {
        return Err(IngestError::UnknownOwner(owner_id.to_string()));
    }

    // 1. Dedup gate
    if let Some(dup) = find_duplicate(&tx, owner_id, &canonical_text, &hash, url.as_deref(), now, cfg)? {
        merge_duplicate(&tx, &dup.memory_id, &metadata, cfg, now)?;
        tx.commit()?;
        info!(owner = owner_id, id = %dup.memory_id, reason = %dup.reason, "duplicate merged");
        return Ok(IngestOutcome::Duplicate {
            id: dup.memory_id,
            reason: dup.reason,
        });
    }

    // 2. Insert
    let id = uuid::Uuid::now_v7().to_string();
    let record = Memory {
        id: id.clone(),
        owner_id: owner_id.to_string(),
        content: new.content,
        canonical_text,
        canonical_hash: hash,
        url,
        title,
        summary: None,
        metadata,
        confidence: INITIAL_CONFIDENCE,
        access_count: 0,
        created_at: now,
        updated_at: now,
    };

    match insert_memory(&tx, &record) {
        Ok(()) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            // Another writer committed the same canonical hash between our
            // lookup and insert; its row wins.
            let winner: String = tx.query_row(
                "SELECT id FROM memories WHERE owner_id = ?1 AND canonical_hash = ?2",
                params![owner_id, record.canonical_hash],
                |row| row.get(0),
            )?;
            merge_duplicate(&tx, &winner, &record.metadata, cfg, now)?;
            tx.commit()?;
            debug!(owner = owner_id, id = %winner, "insert lost race, merged into winner");
            return Ok(IngestOutcome::Duplicate {
                id: winner,
                reason: DuplicateReason::Canonical,
            });
        }
        Err(e) => return Err(e.into()),
    }

    // 3. FTS sync
    index_fts(&tx, &record)?;

    // 4. Audit
    write_audit_log(&tx, "create", &id, None)?;
    tx.commit()?;

    info!(owner = owner_id, %id, "memory created");
    Ok(IngestOutcome::Created { id })
}

fn insert_memory(conn: &Connection, m: &Memory) -> rusqlite::Result<()> {
    let metadata_json = serde_json::to_string(&m.metadata)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let normalized = m.url.as_deref().and_then(normalize_url);
    conn.execute(
        "INSERT INTO memories (id, owner_id, content, canonical_text, canonical_hash, url, \
         normalized_url, title, summary, metadata, confidence, access_count, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            m.id,
            m.owner_id,
            m.content,
            m.canonical_text,
            m.canonical_hash,
            m.url,
            normalized,
            m.title,
            m.summary,
            metadata_json,
            m.confidence,
            m.access_count,
            format_timestamp(m.created_at),
        ],
    )?;
    Ok(())
}

/// (Re)write the FTS5 row for a memory.
fn index_fts(conn: &Connection, m: &Memory) -> Result<()> {
    conn.execute("DELETE FROM memories_fts WHERE id = ?1", [&m.id])?;
    conn.execute(
        "INSERT INTO memories_fts (title, summary, content, id, owner_id) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            m.title.as_deref().unwrap_or(""),
            m.summary.as_deref().unwrap_or(""),
            m.content,
            m.id,
            m.owner_id,
        ],
    )?;
    Ok(())
}

/// Register an owner. Returns `false` if it already existed.
pub fn register_owner(conn: &Connection, owner_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        bail!("owner id must not be empty");
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO owners (id, created_at) VALUES (?1, ?2)",
        params![owner_id, format_timestamp(now)],
    )?;
    Ok(inserted > 0)
}

pub fn owner_exists(conn: &Connection, owner_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM owners WHERE id = ?1", [owner_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn list_owners(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM owners ORDER BY id")?;
    let owners = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(owners)
}

pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_memory).optional()?)
}

/// Owner of a memory, if the memory exists.
pub fn memory_owner(conn: &Connection, id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT owner_id FROM memories WHERE id = ?1", [id], |row| row.get(0))
        .optional()?)
}

/// The owner's most recent memories, newest first.
pub fn list_owner_memories(conn: &Connection, owner_id: &str, limit: usize) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE owner_id = ?1 \
         ORDER BY created_at DESC, id DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let memories = stmt
        .query_map(params![owner_id, limit as i64], row_to_memory)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(memories)
}

/// Attach (or replace) a memory's summary and refresh its FTS row.
/// Returns `false` if the memory does not exist.
pub fn attach_summary(conn: &mut Connection, id: &str, summary: &str, now: DateTime<Utc>) -> Result<bool> {
    let tx = conn.transaction()?;
    let updated = tx.execute(
        "UPDATE memories SET summary = ?1, updated_at = ?2 WHERE id = ?3",
        params![summary.trim(), format_timestamp(now), id],
    )?;
    if updated == 0 {
        return Ok(false);
    }
    if let Some(memory) = get_memory(&tx, id)? {
        index_fts(&tx, &memory)?;
    }
    write_audit_log(&tx, "summary", id, None)?;
    tx.commit()?;
    Ok(true)
}

/// Append an embedding. Embeddings are append-only per (memory, type): a
/// second write for the same pair is ignored and `false` is returned.
///
/// Only primary-model `content` vectors of the index dimension go into
/// `memories_vec`; fallback vectors are stored but never indexed.
pub fn append_embedding(conn: &mut Connection, embedding: &Embedding, now: DateTime<Utc>) -> Result<bool> {
    let tx = conn.transaction()?;
    let Some(owner_id) = memory_owner(&tx, &embedding.memory_id)? else {
        bail!("memory not found: {}", embedding.memory_id);
    };

    let inserted = tx.execute(
        "INSERT OR IGNORE INTO memory_embeddings \
         (memory_id, embedding_type, model, dimensions, fallback, vector, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            embedding.memory_id,
            embedding.embedding_type.as_str(),
            embedding.model,
            embedding.vector.len() as i64,
            embedding.fallback,
            embedding_to_bytes(&embedding.vector),
            format_timestamp(now),
        ],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    if embedding.embedding_type == EmbeddingType::Content
        && !embedding.fallback
        && embedding.vector.len() == EMBEDDING_DIM
    {
        tx.execute(
            "INSERT INTO memories_vec (id, owner_id, embedding) VALUES (?1, ?2, ?3)",
            params![
                embedding.memory_id,
                owner_id,
                embedding_to_bytes(&embedding.vector)
            ],
        )?;
    }

    write_audit_log(
        &tx,
        "embed",
        &embedding.memory_id,
        Some(&serde_json::json!({
            "type": embedding.embedding_type.as_str(),
            "model": embedding.model,
            "fallback": embedding.fallback,
        })),
    )?;
    tx.commit()?;
    Ok(true)
}

/// Embedding types already stored for a memory.
pub fn embedding_types_for(conn: &Connection, memory_id: &str) -> Result<Vec<EmbeddingType>> {
    let mut stmt = conn.prepare(
        "SELECT embedding_type FROM memory_embeddings WHERE memory_id = ?1 ORDER BY embedding_type",
    )?;
    let raw = stmt
        .query_map([memory_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(raw.iter().filter_map(|t| t.parse().ok()).collect())
}

pub fn load_embedding(
    conn: &Connection,
    memory_id: &str,
    embedding_type: EmbeddingType,
) -> Result<Option<Embedding>> {
    Ok(conn
        .query_row(
            "SELECT model, fallback, vector FROM memory_embeddings \
             WHERE memory_id = ?1 AND embedding_type = ?2",
            params![memory_id, embedding_type.as_str()],
            |row| {
                Ok(Embedding {
                    memory_id: memory_id.to_string(),
                    embedding_type,
                    model: row.get(0)?,
                    fallback: row.get(1)?,
                    vector: bytes_to_embedding(&row.get::<_, Vec<u8>>(2)?),
                })
            },
        )
        .optional()?)
}

/// Bump access counters for memories returned to a caller.
pub fn touch_access(conn: &Connection, ids: &[String], now: DateTime<Utc>) -> Result<()> {
    let ts = format_timestamp(now);
    let mut stmt = conn.prepare(
        "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![ts, id])?;
    }
    Ok(())
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = format_timestamp(Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}

/// Map a row selected with [`MEMORY_COLUMNS`] to a [`Memory`].
pub(crate) fn row_to_memory(row: &Row) -> rusqlite::Result<Memory> {
    let metadata_raw: String = row.get(8)?;
    let metadata = serde_json::from_str(&metadata_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Memory {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        content: row.get(2)?,
        canonical_text: row.get(3)?,
        canonical_hash: row.get(4)?,
        url: row.get(5)?,
        title: row.get(6)?,
        summary: row.get(7)?,
        metadata,
        confidence: row.get(9)?,
        access_count: row.get(10)?,
        created_at: parse_timestamp(11, &row.get::<_, String>(11)?)?,
        updated_at: parse_timestamp(12, &row.get::<_, String>(12)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_db() -> Connection {
        let conn = db::open_memory_database().unwrap();
        register_owner(&conn, "alice", Utc::now()).unwrap();
        conn
    }

    fn new_memory(content: &str) -> NewMemory {
        NewMemory {
            content: content.into(),
            ..Default::default()
        }
    }

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    #[test]
    fn test_ingest_new_memory() {
        let mut conn = test_db();
        let outcome = ingest_memory(
            &mut conn,
            "alice",
            NewMemory {
                content: "Rust is a <b>systems</b> language".into(),
                url: Some("https://www.rust-lang.org/learn?utm_source=x".into()),
                title: Some("  Learn Rust ".into()),
                ..Default::default()
            },
            &DedupConfig::default(),
            Utc::now(),
        )
        .unwrap();

        let IngestOutcome::Created { id } = outcome else {
            panic!("expected created");
        };
        let memory = get_memory(&conn, &id).unwrap().unwrap();
        assert_eq!(memory.canonical_text, "rust is a systems language");
        assert_eq!(memory.title.as_deref(), Some("Learn Rust"));
        assert_eq!(memory.confidence, INITIAL_CONFIDENCE);

        let normalized: String = conn
            .query_row("SELECT normalized_url FROM memories WHERE id = ?1", [&id], |r| r.get(0))
            .unwrap();
        assert_eq!(normalized, "https://www.rust-lang.org/learn");

        let fts_id: String = conn
            .query_row(
                "SELECT id FROM memories_fts WHERE memories_fts MATCH 'systems'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_id, id);
    }

    #[test]
    fn test_identical_content_yields_one_memory() {
        let mut conn = test_db();
        let cfg = DedupConfig::default();
        let first = ingest_memory(&mut conn, "alice", new_memory("same bytes"), &cfg, Utc::now()).unwrap();
        let second = ingest_memory(&mut conn, "alice", new_memory("same bytes"), &cfg, Utc::now()).unwrap();

        assert_eq!(
            second,
            IngestOutcome::Duplicate {
                id: first.id().to_string(),
                reason: DuplicateReason::Canonical
            }
        );
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_input_errors() {
        let mut conn = test_db();
        let cfg = DedupConfig {
            max_content_bytes: 10,
            ..Default::default()
        };

        let err = ingest_memory(&mut conn, "alice", new_memory("   "), &cfg, Utc::now()).unwrap_err();
        assert!(matches!(err, IngestError::EmptyContent));

        let err = ingest_memory(&mut conn, "alice", new_memory("far too long for ten"), &cfg, Utc::now())
            .unwrap_err();
        assert_eq!(err.reason(), "content_too_large");

        let mut bad = new_memory("ok");
        bad.metadata.extra.insert("k".repeat(100), serde_json::json!(1));
        let err = ingest_memory(&mut conn, "alice", bad, &cfg, Utc::now()).unwrap_err();
        assert!(matches!(err, IngestError::InvalidMetadata(_)));

        let err = ingest_memory(&mut conn, "mallory", new_memory("ok"), &cfg, Utc::now()).unwrap_err();
        assert!(matches!(err, IngestError::UnknownOwner(ref o) if o == "mallory"));
    }

    #[test]
    fn test_register_owner_is_idempotent() {
        let conn = test_db();
        assert!(!register_owner(&conn, "alice", Utc::now()).unwrap());
        assert!(register_owner(&conn, "bob", Utc::now()).unwrap());
        assert!(register_owner(&conn, "  ", Utc::now()).is_err());
        assert_eq!(list_owners(&conn).unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_attach_summary_reindexes_fts() {
        let mut conn = test_db();
        let id = ingest_memory(&mut conn, "alice", new_memory("quarterly numbers"), &DedupConfig::default(), Utc::now())
            .unwrap()
            .id()
            .to_string();

        assert!(attach_summary(&mut conn, &id, "Revenue grew", Utc::now()).unwrap());
        assert!(!attach_summary(&mut conn, "missing", "x", Utc::now()).unwrap());

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'revenue'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_append_embedding_is_append_only() {
        let mut conn = test_db();
        let id = ingest_memory(&mut conn, "alice", new_memory("vectors"), &DedupConfig::default(), Utc::now())
            .unwrap()
            .id()
            .to_string();

        let first = Embedding {
            memory_id: id.clone(),
            embedding_type: EmbeddingType::Content,
            model: "test".into(),
            vector: spike(0),
            fallback: false,
        };
        let second = Embedding {
            vector: spike(1),
            ..first.clone()
        };
        assert!(append_embedding(&mut conn, &first, Utc::now()).unwrap());
        assert!(!append_embedding(&mut conn, &second, Utc::now()).unwrap());

        let stored = load_embedding(&conn, &id, EmbeddingType::Content).unwrap().unwrap();
        assert_eq!(stored.vector, spike(0));

        let indexed: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories_vec WHERE id = ?1", [&id], |r| r.get(0))
            .unwrap();
        assert_eq!(indexed, 1);
        assert_eq!(embedding_types_for(&conn, &id).unwrap(), vec![EmbeddingType::Content]);
    }

    #[test]
    fn test_fallback_embedding_not_indexed() {
        let mut conn = test_db();
        let id = ingest_memory(&mut conn, "alice", new_memory("offline"), &DedupConfig::default(), Utc::now())
            .unwrap()
            .id()
            .to_string();

        let emb = Embedding {
            memory_id: id.clone(),
            embedding_type: EmbeddingType::Content,
            model: "hashed-bow-v1".into(),
            vector: spike(3),
            fallback: true,
        };
        assert!(append_embedding(&mut conn, &emb, Utc::now()).unwrap());
        let indexed: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories_vec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(indexed, 0);
    }

    #[test]
    fn test_audit_log_written() {
        let mut conn = test_db();
        let cfg = DedupConfig::default();
        let id = ingest_memory(&mut conn, "alice", new_memory("audited"), &cfg, Utc::now())
            .unwrap()
            .id()
            .to_string();
        ingest_memory(&mut conn, "alice", new_memory("Audited"), &cfg, Utc::now()).unwrap();

        let ops: Vec<String> = conn
            .prepare("SELECT operation FROM memory_log WHERE memory_id = ?1 ORDER BY id")
            .unwrap()
            .query_map([&id], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ops, vec!["create", "merge"]);
    }
}
