use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::embedding::EmbeddingType;
use crate::memory::types::RelationType;

/// Store-wide or per-owner statistics.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub owners: u64,
    pub memories: u64,
    pub summarized: u64,
    pub embeddings_by_type: BTreeMap<String, u64>,
    pub fallback_embeddings: u64,
    pub relations_by_type: BTreeMap<String, u64>,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute statistics, optionally restricted to one owner.
///
/// `db_path` is used for file size calculation; pass None for in-memory databases.
pub fn memory_stats(conn: &Connection, owner: Option<&str>, db_path: Option<&Path>) -> Result<StatsResponse> {
    let owners = match owner {
        Some(o) => conn.query_row("SELECT COUNT(*) FROM owners WHERE id = ?1", [o], |r| r.get::<_, i64>(0))?,
        None => conn.query_row("SELECT COUNT(*) FROM owners", [], |r| r.get::<_, i64>(0))?,
    };

    let (filter, param) = owner_filter(owner, "owner_id");
    let (memories, summarized, oldest, newest): (i64, i64, Option<String>, Option<String>) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COUNT(summary), MIN(created_at), MAX(created_at) FROM memories {filter}"
        ),
        params![param],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let embeddings_by_type = count_embeddings(conn, owner)?;
    let (filter, param) = owner_filter(owner, "m.owner_id");
    let fallback_embeddings: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM memory_embeddings e JOIN memories m ON m.id = e.memory_id \
             {filter} AND e.fallback = 1"
        ),
        params![param],
        |row| row.get(0),
    )?;
    let relations_by_type = count_relations(conn, owner)?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        owner_id: owner.map(str::to_string),
        owners: owners as u64,
        memories: memories as u64,
        summarized: summarized as u64,
        embeddings_by_type,
        fallback_embeddings: fallback_embeddings as u64,
        relations_by_type,
        db_size_bytes,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

fn count_embeddings(conn: &Connection, owner: Option<&str>) -> Result<BTreeMap<String, u64>> {
    let (filter, param) = owner_filter(owner, "m.owner_id");
    let sql = format!(
        "SELECT e.embedding_type, COUNT(*) FROM memory_embeddings e \
         JOIN memories m ON m.id = e.memory_id {filter} GROUP BY e.embedding_type"
    );
    let mut map: BTreeMap<String, u64> = EmbeddingType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), 0))
        .collect();
    grouped_counts(conn, &sql, param, &mut map)?;
    Ok(map)
}

fn count_relations(conn: &Connection, owner: Option<&str>) -> Result<BTreeMap<String, u64>> {
    let (filter, param) = owner_filter(owner, "owner_id");
    let sql = format!("SELECT relation_type, COUNT(*) FROM memory_relations {filter} GROUP BY relation_type");
    let mut map: BTreeMap<String, u64> = RelationType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), 0))
        .collect();
    grouped_counts(conn, &sql, param, &mut map)?;
    Ok(map)
}

fn grouped_counts(conn: &Connection, sql: &str, param: Option<&str>, map: &mut BTreeMap<String, u64>) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![param], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (key, count) in rows {
        map.insert(key, count as u64);
    }
    Ok(())
}

/// WHERE clause for optional owner filtering. The parameter is always bound
/// as `?1`; without an owner the clause tests it for NULL so the statement
/// shape stays the same.
fn owner_filter<'a>(owner: Option<&'a str>, column: &str) -> (String, Option<&'a str>) {
    match owner {
        Some(o) => (format!("WHERE {column} = ?1"), Some(o)),
        None => ("WHERE ?1 IS NULL".to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, RelationsConfig};
    use crate::embedding::EMBEDDING_DIM;
    use crate::memory::relations::replace_owner_relations;
    use crate::memory::store::{append_embedding, attach_summary, ingest_memory, register_owner, NewMemory};
    use crate::memory::types::{Embedding, RelationEdge};
    use chrono::Utc;

    fn test_db() -> Connection {
        let conn = crate::db::open_memory_database().unwrap();
        register_owner(&conn, "alice", Utc::now()).unwrap();
        register_owner(&conn, "bob", Utc::now()).unwrap();
        conn
    }

    fn insert(conn: &mut Connection, owner: &str, content: &str) -> String {
        ingest_memory(
            conn,
            owner,
            NewMemory {
                content: content.into(),
                ..Default::default()
            },
            &DedupConfig::default(),
            Utc::now(),
        )
        .unwrap()
        .id()
        .to_string()
    }

    #[test]
    fn test_empty_db_stats() {
        let conn = crate::db::open_memory_database().unwrap();
        let stats = memory_stats(&conn, None, None).unwrap();
        assert_eq!(stats.owners, 0);
        assert_eq!(stats.memories, 0);
        assert_eq!(stats.embeddings_by_type["content"], 0);
        assert_eq!(stats.relations_by_type["semantic"], 0);
        assert!(stats.oldest_memory.is_none());
        assert!(stats.newest_memory.is_none());
    }

    #[test]
    fn test_stats_owner_filter() {
        let mut conn = test_db();
        let a = insert(&mut conn, "alice", "first alice note");
        insert(&mut conn, "alice", "second alice note");
        insert(&mut conn, "bob", "bob note");
        attach_summary(&mut conn, &a, "short", Utc::now()).unwrap();

        let all = memory_stats(&conn, None, None).unwrap();
        assert_eq!(all.owners, 2);
        assert_eq!(all.memories, 3);

        let alice = memory_stats(&conn, Some("alice"), None).unwrap();
        assert_eq!(alice.owners, 1);
        assert_eq!(alice.memories, 2);
        assert_eq!(alice.summarized, 1);
        assert!(alice.oldest_memory <= alice.newest_memory);
    }

    #[test]
    fn test_stats_embeddings_and_relations() {
        let mut conn = test_db();
        let a = insert(&mut conn, "alice", "alpha");
        let b = insert(&mut conn, "alice", "beta");
        for (id, fallback) in [(&a, false), (&b, true)] {
            let emb = Embedding {
                memory_id: id.clone(),
                embedding_type: EmbeddingType::Content,
                model: "test".into(),
                vector: vec![0.1; EMBEDDING_DIM],
                fallback,
            };
            append_embedding(&mut conn, &emb, Utc::now()).unwrap();
        }
        let edge = RelationEdge {
            owner_id: "alice".into(),
            source_id: a.clone(),
            target_id: b.clone(),
            relation_type: RelationType::Temporal,
            score: 0.9,
            created_at: Utc::now(),
        };
        replace_owner_relations(&mut conn, "alice", &[edge], &RelationsConfig::default()).unwrap();

        let stats = memory_stats(&conn, Some("alice"), None).unwrap();
        assert_eq!(stats.embeddings_by_type["content"], 2);
        assert_eq!(stats.embeddings_by_type["title"], 0);
        assert_eq!(stats.fallback_embeddings, 1);
        assert_eq!(stats.relations_by_type["temporal"], 1);

        let bob = memory_stats(&conn, Some("bob"), None).unwrap();
        assert_eq!(bob.embeddings_by_type["content"], 0);
        assert_eq!(bob.relations_by_type["temporal"], 0);
    }
}
