//! Relation graph persistence and rebuilds.
//!
//! The stored graph is derived data: a rebuild loads a window of an owner's
//! memories (the newest `max_nodes` plus the memory that triggered it),
//! scores every pair, shapes the candidates and replaces the edges between
//! window members in one transaction. Edges with an endpoint outside the
//! window are left alone, and edges that survive a rebuild keep their
//! original `created_at`.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{info, warn};

use super::scorer::{score_owner, GraphNode};
use super::shaper::shape;
use super::store::{get_memory, list_owner_memories, memory_owner, write_audit_log};
use super::types::{Embedding, RelationEdge};
use super::{bytes_to_embedding, format_timestamp, parse_timestamp};
use crate::config::RelationsConfig;
use crate::embedding::EmbeddingType;

/// Summary of one graph rebuild or prune.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub owner_id: String,
    pub nodes: usize,
    pub candidates: usize,
    pub edges: usize,
}

/// The owner's most recent `max_nodes` memories with their `content`
/// embeddings attached. `anchor`, when it belongs to the owner, is always
/// part of the set even if it is older than the window.
pub fn load_graph_nodes(
    conn: &Connection,
    owner_id: &str,
    max_nodes: usize,
    anchor: Option<&str>,
) -> Result<Vec<GraphNode>> {
    let mut memories = list_owner_memories(conn, owner_id, max_nodes)?;
    if let Some(anchor) = anchor {
        if !memories.iter().any(|m| m.id == anchor) {
            if let Some(memory) = get_memory(conn, anchor)?.filter(|m| m.owner_id == owner_id) {
                memories.push(memory);
            }
        }
    }

    let mut stmt = conn.prepare(
        "SELECT e.memory_id, e.model, e.fallback, e.vector \
         FROM memory_embeddings e JOIN memories m ON m.id = e.memory_id \
         WHERE m.owner_id = ?1 AND e.embedding_type = ?2",
    )?;
    let mut embeddings: HashMap<String, Embedding> = stmt
        .query_map(params![owner_id, EmbeddingType::Content.as_str()], |row| {
            Ok(Embedding {
                memory_id: row.get(0)?,
                embedding_type: EmbeddingType::Content,
                model: row.get(1)?,
                fallback: row.get(2)?,
                vector: bytes_to_embedding(&row.get::<_, Vec<u8>>(3)?),
            })
        })?
        .map(|r| r.map(|e| (e.memory_id.clone(), e)))
        .collect::<Result<_, _>>()?;

    Ok(memories
        .into_iter()
        .map(|m| {
            let embedding = embeddings.remove(&m.id);
            GraphNode::new(m, embedding)
        })
        .collect())
}

/// Score and shape a node set into the edges to persist. Returns
/// (candidate count, shaped edges).
pub fn build_owner_edges(
    owner_id: &str,
    nodes: &[GraphNode],
    cfg: &RelationsConfig,
    now: DateTime<Utc>,
) -> (usize, Vec<RelationEdge>) {
    let candidates = score_owner(nodes, cfg, now);
    let count = candidates.len();
    (count, shape(owner_id, candidates, cfg))
}

/// Replace the owner's whole edge set atomically. Edges below their type's
/// threshold or belonging to another owner are refused. Returns the number of
/// rows written.
pub fn replace_owner_relations(
    conn: &mut Connection,
    owner_id: &str,
    edges: &[RelationEdge],
    cfg: &RelationsConfig,
) -> Result<usize> {
    replace_relations(conn, owner_id, None, edges, cfg)
}

/// Replace only the edges whose two endpoints are both in `node_ids`. Edges
/// reaching outside the window are kept, and new edges must stay inside it.
pub fn replace_window_relations(
    conn: &mut Connection,
    owner_id: &str,
    node_ids: &HashSet<&str>,
    edges: &[RelationEdge],
    cfg: &RelationsConfig,
) -> Result<usize> {
    replace_relations(conn, owner_id, Some(node_ids), edges, cfg)
}

fn replace_relations(
    conn: &mut Connection,
    owner_id: &str,
    scope: Option<&HashSet<&str>>,
    edges: &[RelationEdge],
    cfg: &RelationsConfig,
) -> Result<usize> {
    let in_scope = |source: &str, target: &str| {
        scope.is_none_or(|ids| ids.contains(source) && ids.contains(target))
    };
    let tx = conn.transaction()?;

    let existing: HashMap<(String, String, String), String> = {
        let mut stmt = tx.prepare(
            "SELECT source_id, target_id, relation_type, created_at \
             FROM memory_relations WHERE owner_id = ?1",
        )?;
        let rows = stmt
            .query_map([owner_id], |row| {
                Ok((
                    (row.get(0)?, row.get(1)?, row.get(2)?),
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        rows
    };

    if scope.is_none() {
        tx.execute("DELETE FROM memory_relations WHERE owner_id = ?1", [owner_id])?;
    } else {
        let mut delete = tx.prepare(
            "DELETE FROM memory_relations \
             WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3",
        )?;
        for (source, target, relation_type) in existing.keys() {
            if in_scope(source.as_str(), target.as_str()) {
                delete.execute(params![source, target, relation_type])?;
            }
        }
    }

    let mut written = 0;
    {
        let mut insert = tx.prepare(
            "INSERT INTO memory_relations \
             (source_id, target_id, owner_id, relation_type, score, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(source_id, target_id, relation_type) \
             DO UPDATE SET score = excluded.score",
        )?;
        for edge in edges {
            if edge.owner_id != owner_id {
                warn!(owner = owner_id, edge_owner = %edge.owner_id, "refusing edge from another owner");
                continue;
            }
            if !in_scope(edge.source_id.as_str(), edge.target_id.as_str()) {
                warn!(source = %edge.source_id, target = %edge.target_id, "refusing edge outside the rebuild window");
                continue;
            }
            if edge.score < cfg.threshold(edge.relation_type) || edge.score > 1.0 {
                warn!(
                    source = %edge.source_id,
                    target = %edge.target_id,
                    relation = %edge.relation_type,
                    score = edge.score,
                    "refusing edge outside its acceptance range"
                );
                continue;
            }
            let key = (
                edge.source_id.clone(),
                edge.target_id.clone(),
                edge.relation_type.as_str().to_string(),
            );
            let created_at = existing
                .get(&key)
                .cloned()
                .unwrap_or_else(|| format_timestamp(edge.created_at));
            insert.execute(params![
                edge.source_id,
                edge.target_id,
                owner_id,
                edge.relation_type.as_str(),
                edge.score,
                created_at,
            ])?;
            written += 1;
        }
    }

    tx.commit()?;
    Ok(written)
}

/// Delete every edge touching a memory. Returns the number of rows removed.
pub fn delete_relations_for_memory(conn: &Connection, memory_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM memory_relations WHERE source_id = ?1 OR target_id = ?1",
        [memory_id],
    )?)
}

const EDGE_COLUMNS: &str = "owner_id, source_id, target_id, relation_type, score, created_at";

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<RelationEdge> {
    let relation_type: String = row.get(3)?;
    Ok(RelationEdge {
        owner_id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        relation_type: relation_type.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        score: row.get(4)?,
        created_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
    })
}

/// All stored edges of an owner, ordered by (source, target, type).
pub fn load_owner_relations(conn: &Connection, owner_id: &str) -> Result<Vec<RelationEdge>> {
    let sql = format!(
        "SELECT {EDGE_COLUMNS} FROM memory_relations WHERE owner_id = ?1 \
         ORDER BY source_id, target_id, relation_type"
    );
    let mut stmt = conn.prepare(&sql)?;
    let edges = stmt
        .query_map([owner_id], row_to_edge)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Edges touching one memory, strongest first.
pub fn relations_for_memory(conn: &Connection, memory_id: &str) -> Result<Vec<RelationEdge>> {
    let sql = format!(
        "SELECT {EDGE_COLUMNS} FROM memory_relations WHERE source_id = ?1 OR target_id = ?1 \
         ORDER BY score DESC, source_id, target_id, relation_type"
    );
    let mut stmt = conn.prepare(&sql)?;
    let edges = stmt
        .query_map([memory_id], row_to_edge)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Rebuild the graph of the owner of `memory_id`. Idempotent: re-running on
/// unchanged data rewrites the same edge set.
pub fn rebuild_for_memory(
    conn: &mut Connection,
    memory_id: &str,
    cfg: &RelationsConfig,
    now: DateTime<Utc>,
) -> Result<RebuildReport> {
    let Some(owner_id) = memory_owner(conn, memory_id)? else {
        bail!("memory not found: {memory_id}");
    };
    let nodes = load_graph_nodes(conn, &owner_id, cfg.max_nodes, Some(memory_id))?;
    let (candidates, edges) = build_owner_edges(&owner_id, &nodes, cfg, now);
    commit_rebuild(conn, memory_id, &owner_id, &nodes, candidates, &edges, cfg)
}

/// Persist a freshly built edge set over the window `nodes` and record the
/// rebuild against the memory that triggered it.
///
/// Split from [`rebuild_for_memory`] so callers can score without holding
/// the connection: load nodes, release, [`build_owner_edges`], then commit.
pub fn commit_rebuild(
    conn: &mut Connection,
    memory_id: &str,
    owner_id: &str,
    nodes: &[GraphNode],
    candidates: usize,
    edges: &[RelationEdge],
    cfg: &RelationsConfig,
) -> Result<RebuildReport> {
    let window: HashSet<&str> = nodes.iter().map(GraphNode::id).collect();
    let written = replace_window_relations(conn, owner_id, &window, edges, cfg)?;
    let nodes = nodes.len();
    write_audit_log(
        conn,
        "relate",
        memory_id,
        Some(&serde_json::json!({ "edges": written, "candidates": candidates })),
    )?;

    info!(owner = owner_id, nodes, candidates, edges = written, "relation graph rebuilt");
    Ok(RebuildReport {
        owner_id: owner_id.to_string(),
        nodes,
        candidates,
        edges: written,
    })
}

/// Re-shape the stored edges without re-scoring, e.g. after tightening
/// thresholds, `mutual_k` or `degree_cap`.
pub fn prune_owner_graph(conn: &mut Connection, owner_id: &str, cfg: &RelationsConfig) -> Result<RebuildReport> {
    let stored = load_owner_relations(conn, owner_id)?;
    let candidates = stored.len();
    let eligible: Vec<RelationEdge> = stored
        .into_iter()
        .filter(|e| e.score >= cfg.threshold(e.relation_type))
        .collect();
    let nodes = {
        let mut ids: Vec<&str> = eligible
            .iter()
            .flat_map(|e| [e.source_id.as_str(), e.target_id.as_str()])
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    };

    let shaped = shape(owner_id, eligible, cfg);
    let written = replace_owner_relations(conn, owner_id, &shaped, cfg)?;
    write_audit_log(
        conn,
        "prune",
        owner_id,
        Some(&serde_json::json!({ "before": candidates, "after": written })),
    )?;

    info!(owner = owner_id, before = candidates, after = written, "relation graph pruned");
    Ok(RebuildReport {
        owner_id: owner_id.to_string(),
        nodes,
        candidates,
        edges: written,
    })
}
