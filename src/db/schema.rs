//! SQL DDL for all tables.
//!
//! Defines `owners`, `memories`, `memories_fts` (FTS5), `memory_embeddings`,
//! `memories_vec` (vec0, partitioned by owner), `memory_relations`,
//! `memory_log`, and `schema_meta`. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for the core tables.
const SCHEMA_SQL: &str = r#"
-- Registered owners; every memory belongs to exactly one
CREATE TABLE IF NOT EXISTS owners (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Core memory storage
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL REFERENCES owners(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    canonical_text TEXT NOT NULL,
    canonical_hash TEXT NOT NULL,
    url TEXT,
    normalized_url TEXT,
    title TEXT,
    summary TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    confidence REAL NOT NULL DEFAULT 1.0 CHECK(confidence >= 0.0 AND confidence <= 1.0),
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_owner_hash ON memories(owner_id, canonical_hash);
CREATE INDEX IF NOT EXISTS idx_memories_owner_created ON memories(owner_id, created_at);
CREATE INDEX IF NOT EXISTS idx_memories_owner_url ON memories(owner_id, normalized_url);

-- Full-text search (BM25) over title, summary and content
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    title,
    summary,
    content,
    id UNINDEXED,
    owner_id UNINDEXED
);

-- Embeddings, one per (memory, type), append-only
CREATE TABLE IF NOT EXISTS memory_embeddings (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    embedding_type TEXT NOT NULL CHECK(embedding_type IN ('content','summary','title')),
    model TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    fallback INTEGER NOT NULL DEFAULT 0,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (memory_id, embedding_type)
);

-- Shaped relation graph
CREATE TABLE IF NOT EXISTS memory_relations (
    source_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    owner_id TEXT NOT NULL,
    relation_type TEXT NOT NULL CHECK(relation_type IN ('semantic','topical','temporal')),
    score REAL NOT NULL CHECK(score >= 0.0 AND score <= 1.0),
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, relation_type)
);

CREATE INDEX IF NOT EXISTS idx_relations_owner ON memory_relations(owner_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON memory_relations(target_id);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','merge','summary','embed','relate','prune')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
/// Only primary-model `content` vectors are indexed here.
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(
    id TEXT PRIMARY KEY,
    owner_id TEXT partition key,
    embedding float[768] distance_metric=cosine
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "owners",
            "memories",
            "memories_fts",
            "memory_embeddings",
            "memories_vec",
            "memory_relations",
            "memory_log",
            "schema_meta",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }
}
