//! The [`Engine`]: shared state plus the operations exposed to callers.
//!
//! Holds one SQLite connection behind a mutex, the fallback-wrapped embedding
//! provider, the optional synthesizer, the answer cache and the enrichment
//! worker pool. Every database or provider call runs in `spawn_blocking`.
//!
//! Ingestion acknowledges as soon as the memory row exists. Embedding and
//! relation building happen on the worker pool; search never waits for them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MnemoConfig;
use crate::db;
use crate::embedding::{self, EmbeddingProvider, EmbeddingType, FallbackEmbedder};
use crate::memory::relations::{self, RebuildReport};
use crate::memory::search::{self, Citation, SearchResponse};
use crate::memory::stats::{self, StatsResponse};
use crate::memory::store::{self, IngestError, IngestOutcome, NewMemory};
use crate::memory::types::Embedding;
use crate::pipeline::{Job, JobError, JobHandler, JobStatus, PoolError, TtlCache, WorkerPool};
use crate::synthesis::{self, AnswerSynthesizer};

/// Acknowledgement of an ingestion request.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    #[serde(flatten)]
    pub outcome: IngestOutcome,
    /// Background job enriching the memory, when one was queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// (owner, normalized query, ranked result ids)
type AnswerKey = (String, String, Vec<String>);

#[derive(Debug, Clone)]
struct CachedAnswer {
    answer: String,
    citations: Vec<Citation>,
}

/// Per-owner rebuild locks. Owners never wait on each other.
#[derive(Default)]
struct OwnerLocks(DashMap<String, Arc<Mutex<()>>>);

impl OwnerLocks {
    fn lock_for(&self, owner_id: &str) -> Arc<Mutex<()>> {
        self.0
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn lock_db(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))
}

/// Runs enrichment jobs: embed what is missing, then rebuild the owner graph.
struct EnrichmentRunner {
    db: Arc<Mutex<Connection>>,
    embedder: Arc<FallbackEmbedder>,
    config: Arc<MnemoConfig>,
    owner_locks: Arc<OwnerLocks>,
}

impl EnrichmentRunner {
    fn not_found(memory_id: &str) -> JobError {
        JobError::Permanent(anyhow!("memory not found: {memory_id}"))
    }

    /// Embed the content, title and summary vectors the memory does not have
    /// yet. Provider calls happen without holding the connection.
    fn embed_missing(&self, memory_id: &str) -> Result<usize, JobError> {
        let (memory, present) = {
            let conn = lock_db(&self.db)?;
            let memory = store::get_memory(&conn, memory_id)?.ok_or_else(|| Self::not_found(memory_id))?;
            let present = store::embedding_types_for(&conn, memory_id)?;
            (memory, present)
        };

        let texts = [
            (EmbeddingType::Content, Some(memory.content.as_str())),
            (EmbeddingType::Title, memory.title.as_deref()),
            (EmbeddingType::Summary, memory.summary.as_deref()),
        ];

        let mut added = 0;
        for (kind, text) in texts {
            let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            if present.contains(&kind) {
                continue;
            }
            let embedded = self.embedder.embed(text, kind);
            let embedding = Embedding {
                memory_id: memory.id.clone(),
                embedding_type: kind,
                model: embedded.model,
                vector: embedded.vector,
                fallback: embedded.fallback,
            };
            let mut conn = lock_db(&self.db)?;
            if store::append_embedding(&mut conn, &embedding, Utc::now())? {
                added += 1;
            }
        }
        debug!(memory_id, added, "embeddings appended");
        Ok(added)
    }

    /// Rebuild the graph of the memory's owner, serialized per owner. Scoring
    /// runs with only the owner lock held.
    fn rebuild(&self, memory_id: &str) -> Result<RebuildReport, JobError> {
        let cfg = &self.config.relations;
        let owner_id = {
            let conn = lock_db(&self.db)?;
            store::memory_owner(&conn, memory_id)?.ok_or_else(|| Self::not_found(memory_id))?
        };

        let owner_lock = self.owner_locks.lock_for(&owner_id);
        let _guard = owner_lock.lock().unwrap_or_else(|p| p.into_inner());

        let nodes = {
            let conn = lock_db(&self.db)?;
            relations::load_graph_nodes(&conn, &owner_id, cfg.max_nodes, Some(memory_id))?
        };
        let (candidates, edges) = relations::build_owner_edges(&owner_id, &nodes, cfg, Utc::now());

        let mut conn = lock_db(&self.db)?;
        Ok(relations::commit_rebuild(
            &mut conn,
            memory_id,
            &owner_id,
            &nodes,
            candidates,
            &edges,
            cfg,
        )?)
    }
}

impl JobHandler for EnrichmentRunner {
    fn handle(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::Enrich { memory_id } => {
                self.embed_missing(memory_id)?;
                self.rebuild(memory_id)?;
            }
            Job::RebuildRelations { memory_id } => {
                self.rebuild(memory_id)?;
            }
            Job::RecordAccess { memory_ids } => {
                let conn = lock_db(&self.db)?;
                store::touch_access(&conn, memory_ids, Utc::now())?;
            }
        }
        Ok(())
    }
}

pub struct Engine {
    db: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
    embedder: Arc<FallbackEmbedder>,
    synthesizer: Option<Arc<dyn AnswerSynthesizer>>,
    config: Arc<MnemoConfig>,
    runner: Arc<EnrichmentRunner>,
    answers: Arc<TtlCache<AnswerKey, CachedAnswer>>,
    pool: WorkerPool,
}

impl Engine {
    /// Open the configured database and providers and start the worker pool.
    /// Must be called inside a tokio runtime.
    pub fn open(config: MnemoConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path)?;
        let provider = embedding::create_provider(&config.embedding)?;
        let synthesizer = synthesis::create_synthesizer(&config.synthesis)?;
        info!(
            db = %db_path.display(),
            embedding = provider.model(),
            synthesis = synthesizer.is_some(),
            "engine ready"
        );
        Self::with_parts(conn, Some(db_path), provider, synthesizer, config)
    }

    /// Assemble an engine from already-built parts (tests, embedding hosts).
    pub fn with_parts(
        conn: Connection,
        db_path: Option<PathBuf>,
        provider: Arc<dyn EmbeddingProvider>,
        synthesizer: Option<Arc<dyn AnswerSynthesizer>>,
        config: MnemoConfig,
    ) -> Result<Self> {
        check_embedding_model(&conn, provider.model())?;

        let db = Arc::new(Mutex::new(conn));
        let embedder = Arc::new(FallbackEmbedder::new(provider));
        let config = Arc::new(config);

        let runner = Arc::new(EnrichmentRunner {
            db: Arc::clone(&db),
            embedder: Arc::clone(&embedder),
            config: Arc::clone(&config),
            owner_locks: Arc::new(OwnerLocks::default()),
        });
        let pool = WorkerPool::start(runner.clone(), &config.pipeline);

        let answers = Arc::new(TtlCache::new(
            "answers",
            Duration::from_secs(config.synthesis.cache_ttl_secs),
        ));
        answers.start(Duration::from_secs(config.pipeline.cache_sweep_secs.max(1)));

        Ok(Self {
            db,
            db_path,
            embedder,
            synthesizer,
            config,
            runner,
            answers,
            pool,
        })
    }

    pub fn config(&self) -> &MnemoConfig {
        &self.config
    }

    /// Register an owner. Returns `false` if it already existed.
    pub async fn register_owner(&self, owner_id: &str) -> Result<bool> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| store::register_owner(conn, &owner_id, Utc::now()))
            .await
    }

    /// Validate, deduplicate and store a capture, then queue its enrichment.
    ///
    /// A new memory queues an `Enrich` job; a duplicate queues a relation
    /// rebuild because the merge may have changed its metadata facets.
    pub async fn ingest(&self, owner_id: &str, new: NewMemory) -> Result<IngestReceipt, IngestError> {
        let db = Arc::clone(&self.db);
        let owner = owner_id.to_string();
        let dedup = self.config.dedup.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = lock_db(&db)?;
            store::ingest_memory(&mut conn, &owner, new, &dedup, Utc::now())
        })
        .await
        .map_err(|e| IngestError::Storage(anyhow!("ingest task failed: {e}")))??;

        let job = match &outcome {
            IngestOutcome::Created { id } => Job::Enrich { memory_id: id.clone() },
            IngestOutcome::Duplicate { id, .. } => Job::RebuildRelations { memory_id: id.clone() },
        };
        let job_id = match self.pool.submit(job).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(memory_id = outcome.id(), error = %e, "enrichment not queued");
                None
            }
        };

        info!(
            owner = owner_id,
            memory_id = outcome.id(),
            duplicate = outcome.is_duplicate(),
            "memory ingested"
        );
        Ok(IngestReceipt { outcome, job_id })
    }

    /// Rebuild the relation graph of the memory's owner now, on the calling
    /// task. Idempotent.
    pub async fn rebuild_relations(&self, memory_id: &str) -> Result<RebuildReport> {
        let runner = Arc::clone(&self.runner);
        let memory_id = memory_id.to_string();
        tokio::task::spawn_blocking(move || runner.rebuild(&memory_id))
            .await
            .context("rebuild task failed")?
            .map_err(|e| match e {
                JobError::Retryable(e) | JobError::Permanent(e) => e,
            })
    }

    /// Re-shape the owner's stored edges under the current configuration
    /// without re-scoring.
    pub async fn prune_owner_graph(&self, owner_id: &str) -> Result<RebuildReport> {
        let owner_lock = self.runner.owner_locks.lock_for(owner_id);
        let owner = owner_id.to_string();
        let cfg = self.config.relations.clone();
        self.with_conn_mut(move |conn| {
            let _guard = owner_lock.lock().unwrap_or_else(|p| p.into_inner());
            if !store::owner_exists(conn, &owner)? {
                bail!("unknown owner: {owner}");
            }
            relations::prune_owner_graph(conn, &owner, &cfg)
        })
        .await
    }

    /// Attach or replace a memory's summary and queue embedding of it.
    /// Returns the enrichment job id.
    pub async fn attach_summary(&self, memory_id: &str, summary: &str) -> Result<Option<String>> {
        if summary.trim().is_empty() {
            bail!("summary is empty");
        }
        let id = memory_id.to_string();
        let text = summary.to_string();
        let found = self
            .with_conn_mut(move |conn| store::attach_summary(conn, &id, &text, Utc::now()))
            .await?;
        if !found {
            bail!("memory not found: {memory_id}");
        }

        match self
            .pool
            .submit(Job::Enrich {
                memory_id: memory_id.to_string(),
            })
            .await
        {
            Ok(job_id) => Ok(Some(job_id)),
            Err(PoolError::Closed) => {
                warn!(memory_id, "worker pool closed, summary embedding skipped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Hybrid search within one owner, with an optional synthesized answer.
    ///
    /// Never fails because a sub-step failed: an embedding, index, row or
    /// synthesis failure is logged and listed in `degraded`. The search only
    /// reads; access counts of the returned memories are bumped by a queued
    /// job.
    pub async fn search(&self, owner_id: &str, query: &str, limit: Option<usize>) -> Result<SearchResponse> {
        let limit = limit.unwrap_or(self.config.search.default_limit);
        let mut response = SearchResponse {
            query: query.to_string(),
            ..Default::default()
        };
        if query.trim().is_empty() || limit == 0 {
            return Ok(response);
        }

        let query_vector = self.embed_query(query).await;
        if query_vector.is_none() {
            response.degraded.push("embedding".to_string());
        }

        let owner = owner_id.to_string();
        let query_text = query.to_string();
        let retrieval = self.config.search.clone();
        let ranked = self
            .with_conn(move |conn| {
                if !store::owner_exists(conn, &owner)? {
                    bail!("unknown owner: {owner}");
                }
                search::hybrid_search(conn, &owner, &query_text, query_vector.as_deref(), limit, &retrieval)
            })
            .await?;
        response.results = ranked.hits;
        response.degraded.extend(ranked.degraded);

        if !response.results.is_empty() {
            let memory_ids = response.results.iter().map(|h| h.id.clone()).collect();
            if let Err(e) = self.pool.try_submit(Job::RecordAccess { memory_ids }) {
                debug!(owner = owner_id, error = %e, "access counts not recorded");
            }
        }

        if let Some(synthesizer) = &self.synthesizer {
            if !response.results.is_empty() {
                let synthesized = self.synthesize(synthesizer, owner_id, query, &response).await;
                match synthesized {
                    Some(cached) => {
                        response.answer = Some(cached.answer);
                        response.citations = cached.citations;
                    }
                    None => response.degraded.push("synthesis".to_string()),
                }
            }
        }

        debug!(
            owner = owner_id,
            results = response.results.len(),
            answered = response.answer.is_some(),
            "search complete"
        );
        Ok(response)
    }

    pub async fn stats(&self, owner_id: Option<&str>) -> Result<StatsResponse> {
        let owner = owner_id.map(str::to_string);
        let path = self.db_path.clone();
        self.with_conn(move |conn| stats::memory_stats(conn, owner.as_deref(), path.as_deref()))
            .await
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.pool.status(job_id)
    }

    /// Drain queued enrichment jobs and stop background tasks.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.answers.stop().await;
        info!("engine shut down");
    }

    /// Embed the query with the primary provider only; a hashed fallback
    /// vector would not be comparable with the indexed vectors.
    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let primary = embedder.primary();
            let vector = primary.embed(&text)?;
            anyhow::ensure!(
                vector.len() == primary.dimensions(),
                "query embedding has {} dimensions, expected {}",
                vector.len(),
                primary.dimensions()
            );
            Ok(vector)
        })
        .await;

        match result {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding failed, searching lexically");
                None
            }
            Err(e) => {
                warn!(error = %e, "query embedding task failed, searching lexically");
                None
            }
        }
    }

    async fn synthesize(
        &self,
        synthesizer: &Arc<dyn AnswerSynthesizer>,
        owner_id: &str,
        query: &str,
        response: &SearchResponse,
    ) -> Option<CachedAnswer> {
        let snippets = search::snippets_for(&response.results, self.config.synthesis.top_n);
        let key: AnswerKey = (
            owner_id.to_string(),
            normalize_query(query),
            snippets.iter().map(|s| s.memory_id.clone()).collect(),
        );
        if let Some(cached) = self.answers.get(&key) {
            debug!(owner = owner_id, "synthesized answer served from cache");
            return Some(cached);
        }

        let synthesizer = Arc::clone(synthesizer);
        let text = query.to_string();
        let task_snippets = snippets.clone();
        let result = tokio::task::spawn_blocking(move || synthesizer.synthesize(&text, &task_snippets)).await;

        let answer = match result {
            Ok(Ok(answer)) if !answer.trim().is_empty() => answer,
            Ok(Ok(_)) => {
                warn!("synthesizer returned an empty answer");
                return None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "answer synthesis failed, returning results only");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "synthesis task failed, returning results only");
                return None;
            }
        };

        let cached = CachedAnswer {
            citations: search::citations_for(&answer, &snippets),
            answer,
        };
        self.answers.insert(key, cached.clone());
        Some(cached)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = lock_db(&db)?;
            f(&conn)
        })
        .await
        .context("db task failed")?
    }

    async fn with_conn_mut<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock_db(&db)?;
            f(&mut conn)
        })
        .await
        .context("db task failed")?
    }
}

/// Record the embedding model on first use; warn when it changes, since
/// vectors from different models are never compared.
fn check_embedding_model(conn: &Connection, model: &str) -> Result<()> {
    match db::migrations::get_embedding_model(conn)? {
        None => db::migrations::set_embedding_model(conn, model)?,
        Some(stored) if stored != model => warn!(
            stored = %stored,
            configured = %model,
            "embedding model changed; existing vectors will not match new queries"
        ),
        Some(_) => {}
    }
    Ok(())
}

/// Lowercased, whitespace-collapsed query used in answer cache keys.
fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedder;
    use crate::pipeline::JobState;

    async fn engine() -> Engine {
        let conn = db::open_memory_database().unwrap();
        let provider = Arc::new(HashedEmbedder::new(crate::embedding::EMBEDDING_DIM));
        let engine = Engine::with_parts(conn, None, provider, None, MnemoConfig::default()).unwrap();
        engine.register_owner("alice").await.unwrap();
        engine
    }

    async fn wait_job(engine: &Engine, job_id: &str) -> JobStatus {
        for _ in 0..400 {
            if let Some(status) = engine.job_status(job_id) {
                if status.state.is_finished() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[test]
    fn normalize_query_folds_case_and_space() {
        assert_eq!(normalize_query("  Rust   Async\tIO "), "rust async io");
    }

    #[tokio::test]
    async fn ingest_then_enrichment_embeds_content() {
        let engine = engine().await;
        let receipt = engine
            .ingest(
                "alice",
                NewMemory {
                    content: "tokio worker pools".into(),
                    title: Some("Pools".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let job_id = receipt.job_id.clone().unwrap();
        assert_eq!(wait_job(&engine, &job_id).await.state, JobState::Succeeded);

        let types = {
            let conn = engine.db.lock().unwrap();
            store::embedding_types_for(&conn, receipt.outcome.id()).unwrap()
        };
        assert!(types.contains(&EmbeddingType::Content));
        assert!(types.contains(&EmbeddingType::Title));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_owner_is_rejected() {
        let engine = engine().await;
        let err = engine
            .ingest(
                "mallory",
                NewMemory {
                    content: "hello".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "unknown_owner");
        assert!(engine.search("mallory", "hello", None).await.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn check_embedding_model_records_first_model() {
        let conn = db::open_memory_database().unwrap();
        check_embedding_model(&conn, "model-a").unwrap();
        check_embedding_model(&conn, "model-b").unwrap();
        assert_eq!(
            db::migrations::get_embedding_model(&conn).unwrap().as_deref(),
            Some("model-a")
        );
    }
}
