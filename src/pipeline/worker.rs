//! Bounded worker pool for background enrichment jobs.
//!
//! Jobs travel over a bounded `mpsc` channel shared by N worker tasks. Each
//! job runs its synchronous handler on the blocking thread pool and is
//! retried with exponential backoff. Job state is kept in a [`TtlCache`] so
//! callers can poll it by id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::TtlCache;
use crate::config::PipelineConfig;

/// Background work on stored memories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Embed whatever the memory is missing, then rebuild its owner's graph.
    Enrich { memory_id: String },
    /// Rebuild the owner's graph only.
    RebuildRelations { memory_id: String },
    /// Bump access counts of memories returned by a search.
    RecordAccess { memory_ids: Vec<String> },
}

impl Job {
    pub fn memory_ids(&self) -> &[String] {
        match self {
            Self::Enrich { memory_id } | Self::RebuildRelations { memory_id } => {
                std::slice::from_ref(memory_id)
            }
            Self::RecordAccess { memory_ids } => memory_ids,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Enrich { .. } => "enrich",
            Self::RebuildRelations { .. } => "rebuild_relations",
            Self::RecordAccess { .. } => "record_access",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running { attempt: u32 },
    Succeeded,
    Failed { message: String },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub job: Job,
    #[serde(flatten)]
    pub state: JobState,
}

/// Errors a job handler reports back to the pool.
#[derive(Debug, Error)]
pub enum JobError {
    /// Worth another attempt (busy database, provider hiccup).
    #[error("{0:#}")]
    Retryable(anyhow::Error),
    /// Retrying cannot help (memory deleted, invalid data).
    #[error("{0:#}")]
    Permanent(anyhow::Error),
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        Self::Retryable(e)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("job queue is full")]
    QueueFull,
    #[error("worker pool is shut down")]
    Closed,
}

/// Synchronous job execution. Runs inside `spawn_blocking`.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: &Job) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            multiplier: cfg.backoff_multiplier,
        }
    }

    /// Delay before retry number `attempt + 1` (attempt is 0-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

struct Envelope {
    job_id: String,
    job: Job,
}

/// Everything a worker task needs, cloned once per worker.
#[derive(Clone)]
struct WorkerContext {
    handler: Arc<dyn JobHandler>,
    statuses: Arc<TtlCache<String, JobStatus>>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    statuses: Arc<TtlCache<String, JobStatus>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn the workers and the status-cache janitor. Must be called inside
    /// a tokio runtime.
    pub fn start(handler: Arc<dyn JobHandler>, cfg: &PipelineConfig) -> Self {
        let worker_count = cfg.workers.max(1);
        let (tx, rx) = mpsc::channel::<Envelope>(cfg.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let statuses = Arc::new(TtlCache::new(
            "job_status",
            Duration::from_secs(cfg.job_status_ttl_secs),
        ));
        statuses.start(Duration::from_secs(cfg.cache_sweep_secs.max(1)));

        let cancel = CancellationToken::new();
        let ctx = WorkerContext {
            handler,
            statuses: Arc::clone(&statuses),
            policy: RetryPolicy::from_config(cfg),
            cancel: cancel.clone(),
        };

        let workers = (0..worker_count)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(envelope) = next else { break };
                        run_job(&ctx, envelope).await;
                    }
                    debug!(worker, "worker exited");
                })
            })
            .collect();

        info!(workers = worker_count, queue_capacity = cfg.queue_capacity, "worker pool started");
        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            statuses,
            cancel,
        }
    }

    /// Enqueue a job, waiting for queue capacity. Returns the job id.
    pub async fn submit(&self, job: Job) -> Result<String, PoolError> {
        let sender = self.sender()?;
        let envelope = self.register(job);
        let job_id = envelope.job_id.clone();
        if sender.send(envelope).await.is_err() {
            self.statuses.remove(&job_id);
            return Err(PoolError::Closed);
        }
        Ok(job_id)
    }

    /// Enqueue a job without waiting. Fails with [`PoolError::QueueFull`]
    /// when the queue is at capacity.
    pub fn try_submit(&self, job: Job) -> Result<String, PoolError> {
        let sender = self.sender()?;
        let envelope = self.register(job);
        let job_id = envelope.job_id.clone();
        match sender.try_send(envelope) {
            Ok(()) => Ok(job_id),
            Err(e) => {
                self.statuses.remove(&job_id);
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => PoolError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
                })
            }
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.statuses.get(&job_id.to_string())
    }

    /// Stop accepting jobs, let workers drain the queue, then stop the
    /// status janitor. Jobs waiting on a retry backoff fail immediately.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        self.statuses.stop().await;
        info!("worker pool stopped");
    }

    fn sender(&self) -> Result<mpsc::Sender<Envelope>, PoolError> {
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(PoolError::Closed)
    }

    fn register(&self, job: Job) -> Envelope {
        let job_id = Uuid::now_v7().to_string();
        self.statuses.insert(
            job_id.clone(),
            JobStatus {
                job_id: job_id.clone(),
                job: job.clone(),
                state: JobState::Queued,
            },
        );
        Envelope { job_id, job }
    }
}

async fn run_job(ctx: &WorkerContext, envelope: Envelope) {
    let Envelope { job_id, job } = envelope;
    let set_state = |state: JobState| {
        ctx.statuses.insert(
            job_id.clone(),
            JobStatus {
                job_id: job_id.clone(),
                job: job.clone(),
                state,
            },
        );
    };

    let mut attempt = 0u32;
    loop {
        set_state(JobState::Running { attempt: attempt + 1 });

        let handler = Arc::clone(&ctx.handler);
        let job_for_task = job.clone();
        let outcome = tokio::task::spawn_blocking(move || handler.handle(&job_for_task)).await;

        let (message, retryable) = match outcome {
            Ok(Ok(())) => {
                debug!(job_id = %job_id, kind = job.kind(), memory_ids = ?job.memory_ids(), "job succeeded");
                set_state(JobState::Succeeded);
                return;
            }
            Ok(Err(JobError::Retryable(e))) => (format!("{e:#}"), true),
            Ok(Err(JobError::Permanent(e))) => (format!("{e:#}"), false),
            Err(e) => (format!("job task failed: {e}"), false),
        };

        if !retryable || attempt >= ctx.policy.max_retries {
            warn!(
                job_id = %job_id,
                kind = job.kind(),
                memory_ids = ?job.memory_ids(),
                attempts = attempt + 1,
                error = %message,
                "job failed"
            );
            set_state(JobState::Failed { message });
            return;
        }

        let delay = ctx.policy.compute_delay(attempt);
        warn!(
            job_id = %job_id,
            kind = job.kind(),
            attempt = attempt + 1,
            max_retries = ctx.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retrying job"
        );
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                set_state(JobState::Failed { message: format!("shut down while retrying: {message}") });
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
