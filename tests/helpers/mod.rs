#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mnemograph::config::{DedupConfig, MnemoConfig};
use mnemograph::db;
use mnemograph::embedding::{EmbeddingProvider, EmbeddingType, HashedEmbedder, EMBEDDING_DIM};
use mnemograph::memory::store::{append_embedding, ingest_memory, register_owner, NewMemory};
use mnemograph::memory::types::{Embedding, MemoryMetadata};
use mnemograph::pipeline::{JobState, JobStatus};
use mnemograph::synthesis::AnswerSynthesizer;
use mnemograph::Engine;
use rusqlite::Connection;

/// Open a fresh in-memory database with schema and migrations applied and
/// the owners `alice` and `bob` registered.
pub fn test_db() -> Connection {
    let conn = db::open_memory_database().unwrap();
    register_owner(&conn, "alice", Utc::now()).unwrap();
    register_owner(&conn, "bob", Utc::now()).unwrap();
    conn
}

/// Deterministic 768-dim unit vector with a spike at position `seed`.
/// Distinct seeds are orthogonal.
pub fn test_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed % EMBEDDING_DIM] = 1.0;
    v
}

/// Unit vector whose cosine similarity with `test_embedding(0)` is `cos`.
pub fn embedding_at(cos: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[0] = cos;
    v[1] = (1.0 - cos * cos).max(0.0).sqrt();
    v
}

/// Ingest a memory and return its id (panics on duplicate).
pub fn insert_memory(
    conn: &mut Connection,
    owner: &str,
    content: &str,
    url: Option<&str>,
    metadata: MemoryMetadata,
    at: DateTime<Utc>,
) -> String {
    let outcome = ingest_memory(
        conn,
        owner,
        NewMemory {
            content: content.into(),
            url: url.map(str::to_string),
            title: None,
            metadata,
        },
        &DedupConfig::default(),
        at,
    )
    .unwrap();
    assert!(!outcome.is_duplicate(), "unexpected duplicate for {content:?}");
    outcome.id().to_string()
}

/// Attach a primary-model content embedding.
pub fn embed_content(conn: &mut Connection, memory_id: &str, vector: Vec<f32>, at: DateTime<Utc>) {
    let emb = Embedding {
        memory_id: memory_id.to_string(),
        embedding_type: EmbeddingType::Content,
        model: "test-model".into(),
        vector,
        fallback: false,
    };
    append_embedding(conn, &emb, at).unwrap();
}

/// Metadata with the given topics.
pub fn topics(list: &[&str]) -> MemoryMetadata {
    MemoryMetadata {
        topics: list.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

/// Engine over a fresh in-memory database with `alice` and `bob` registered.
pub async fn test_engine(
    provider: Arc<dyn EmbeddingProvider>,
    synthesizer: Option<Arc<dyn AnswerSynthesizer>>,
) -> Engine {
    let conn = db::open_memory_database().unwrap();
    let engine = Engine::with_parts(conn, None, provider, synthesizer, MnemoConfig::default()).unwrap();
    engine.register_owner("alice").await.unwrap();
    engine.register_owner("bob").await.unwrap();
    engine
}

/// Engine whose primary provider is the deterministic hashed embedder.
pub async fn hashed_engine(synthesizer: Option<Arc<dyn AnswerSynthesizer>>) -> Engine {
    test_engine(Arc::new(HashedEmbedder::new(EMBEDDING_DIM)), synthesizer).await
}

/// Poll until a background job reaches a terminal state.
pub async fn wait_for_job(engine: &Engine, job_id: &str) -> JobStatus {
    for _ in 0..1000 {
        if let Some(status) = engine.job_status(job_id) {
            if status.state.is_finished() {
                return status;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("job {job_id} did not finish");
}

/// Ingest through the engine and wait for enrichment to finish.
pub async fn ingest_and_wait(engine: &Engine, owner: &str, content: &str, title: Option<&str>) -> String {
    let receipt = engine
        .ingest(
            owner,
            NewMemory {
                content: content.into(),
                title: title.map(str::to_string),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let job_id = receipt.job_id.expect("enrichment job queued");
    let status = wait_for_job(engine, &job_id).await;
    assert_eq!(status.state, JobState::Succeeded, "{status:?}");
    receipt.outcome.id().to_string()
}
