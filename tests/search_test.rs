mod helpers;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use helpers::{hashed_engine, ingest_and_wait};
use mnemograph::config::MnemoConfig;
use mnemograph::db;
use mnemograph::embedding::{HashedEmbedder, EMBEDDING_DIM};
use mnemograph::memory::store::get_memory;
use mnemograph::synthesis::{AnswerSynthesizer, Snippet};
use mnemograph::Engine;

/// Answers by citing the first snippet plus an out-of-range marker.
#[derive(Default)]
struct CitingSynthesizer {
    calls: AtomicUsize,
}

impl AnswerSynthesizer for CitingSynthesizer {
    fn synthesize(&self, _query: &str, snippets: &[Snippet]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Enable WAL mode [1]. Ignore [{}].", snippets.len() + 5))
    }
}

struct BrokenSynthesizer;

impl AnswerSynthesizer for BrokenSynthesizer {
    fn synthesize(&self, _query: &str, _snippets: &[Snippet]) -> Result<String> {
        anyhow::bail!("upstream returned 503")
    }
}

/// Engine over an on-disk database so a second connection can inspect or
/// tamper with it.
async fn file_engine(path: &Path) -> Engine {
    let conn = db::open_database(path).unwrap();
    let engine = Engine::with_parts(
        conn,
        Some(path.to_path_buf()),
        Arc::new(HashedEmbedder::new(EMBEDDING_DIM)),
        None,
        MnemoConfig::default(),
    )
    .unwrap();
    engine.register_owner("alice").await.unwrap();
    engine
}

const WAL: &str = "SQLite WAL mode lets readers proceed while a writer commits";
const BREAD: &str = "Sourdough starter needs feeding twice a day at room temperature";
const KAFKA: &str = "Kafka consumer lag grows when partitions are rebalanced too often";

#[tokio::test]
async fn hybrid_search_ranks_matching_memory_first() {
    let engine = hashed_engine(None).await;
    let wal = ingest_and_wait(&engine, "alice", WAL, Some("SQLite notes")).await;
    ingest_and_wait(&engine, "alice", BREAD, None).await;
    ingest_and_wait(&engine, "alice", KAFKA, None).await;

    let response = engine.search("alice", WAL, None).await.unwrap();
    assert!(response.degraded.is_empty(), "{:?}", response.degraded);
    assert!(response.answer.is_none());

    let top = &response.results[0];
    assert_eq!(top.id, wal);
    assert_eq!(top.title.as_deref(), Some("SQLite notes"));
    assert!(top.keyword_score.is_some());
    let semantic = top.semantic_score.expect("exact text should match semantically");
    assert!(semantic > 0.99, "semantic {semantic}");
    assert!(top.score > 0.0 && top.score <= 1.0);

    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn search_is_scoped_to_owner() {
    let engine = hashed_engine(None).await;
    let mine = ingest_and_wait(&engine, "alice", WAL, None).await;
    let theirs = ingest_and_wait(&engine, "bob", WAL, None).await;
    assert_ne!(mine, theirs);

    let response = engine.search("alice", "sqlite wal readers", None).await.unwrap();
    let ids: Vec<&str> = response.results.iter().map(|h| h.id.as_str()).collect();
    assert!(ids.contains(&mine.as_str()));
    assert!(!ids.contains(&theirs.as_str()));
    engine.shutdown().await;
}

#[tokio::test]
async fn empty_query_and_zero_limit_return_nothing() {
    let engine = hashed_engine(None).await;
    ingest_and_wait(&engine, "alice", WAL, None).await;

    assert!(engine.search("alice", "   ", None).await.unwrap().results.is_empty());
    assert!(engine.search("alice", "sqlite", Some(0)).await.unwrap().results.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn limit_caps_result_count() {
    let engine = hashed_engine(None).await;
    for i in 0..5 {
        ingest_and_wait(&engine, "alice", &format!("deploy checklist step {i} for the api gateway"), None).await;
    }

    let response = engine.search("alice", "deploy checklist", Some(2)).await.unwrap();
    assert_eq!(response.results.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn synthesized_answer_cites_ranked_results_and_is_cached() {
    let synthesizer = Arc::new(CitingSynthesizer::default());
    let engine = hashed_engine(Some(synthesizer.clone())).await;
    let wal = ingest_and_wait(&engine, "alice", WAL, None).await;
    ingest_and_wait(&engine, "alice", KAFKA, None).await;

    let first = engine.search("alice", "SQLite WAL readers", None).await.unwrap();
    assert!(first.answer.as_deref().unwrap().contains("[1]"));
    assert_eq!(first.citations.len(), 1, "out-of-range markers are dropped");
    assert_eq!(first.citations[0].position, 1);
    assert_eq!(first.citations[0].memory_id, first.results[0].id);
    assert_eq!(first.results[0].id, wal);

    let second = engine.search("alice", "  sqlite   wal READERS ", None).await.unwrap();
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.citations, first.citations);
    assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn synthesis_failure_degrades_to_results_only() {
    let engine = hashed_engine(Some(Arc::new(BrokenSynthesizer))).await;
    let wal = ingest_and_wait(&engine, "alice", WAL, None).await;

    let response = engine.search("alice", "sqlite wal", None).await.unwrap();
    assert_eq!(response.results[0].id, wal);
    assert!(response.answer.is_none());
    assert!(response.citations.is_empty());
    assert_eq!(response.degraded, vec!["synthesis".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn search_bumps_access_counts_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = file_engine(&path).await;
    let wal = ingest_and_wait(&engine, "alice", WAL, None).await;
    ingest_and_wait(&engine, "alice", BREAD, None).await;

    engine.search("alice", "sqlite wal", None).await.unwrap();
    engine.search("alice", "sqlite wal", None).await.unwrap();
    // Shutdown drains the queued access jobs.
    engine.shutdown().await;

    let reader = db::open_database(&path).unwrap();
    let hit = get_memory(&reader, &wal).unwrap().unwrap();
    assert_eq!(hit.access_count, 2);

    let stats = engine.stats(Some("alice")).await.unwrap();
    assert_eq!(stats.memories, 2);
    assert!(stats.db_size_bytes > 0);
}

#[tokio::test]
async fn failing_index_scans_degrade_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = file_engine(&path).await;
    let wal = ingest_and_wait(&engine, "alice", WAL, None).await;
    let side = db::open_database(&path).unwrap();

    side.execute_batch("DROP TABLE memories_vec").unwrap();
    let response = engine.search("alice", "sqlite wal readers", None).await.unwrap();
    assert_eq!(response.degraded, vec!["semantic".to_string()]);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, wal);
    assert!(response.results[0].semantic_score.is_none());

    side.execute_batch("DROP TABLE memories_fts").unwrap();
    let response = engine.search("alice", "sqlite wal readers", None).await.unwrap();
    assert_eq!(response.degraded, vec!["lexical".to_string(), "semantic".to_string()]);
    assert!(response.results.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn unreadable_rows_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = file_engine(&path).await;
    let good = ingest_and_wait(&engine, "alice", WAL, None).await;
    let bad = ingest_and_wait(&engine, "alice", "SQLite WAL checkpoints stall readers", None).await;

    let side = db::open_database(&path).unwrap();
    side.execute("UPDATE memories SET created_at = 'garbled' WHERE id = ?1", [&bad])
        .unwrap();

    let response = engine.search("alice", "sqlite wal readers", None).await.unwrap();
    assert_eq!(response.degraded, vec!["rows".to_string()]);
    let ids: Vec<&str> = response.results.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec![good.as_str()]);
    engine.shutdown().await;
}
