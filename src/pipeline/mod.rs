//! Background enrichment: a bounded worker pool with retry/backoff and the
//! TTL caches it and the search path share.

pub mod cache;
pub mod worker;

pub use cache::TtlCache;
pub use worker::{Job, JobError, JobHandler, JobState, JobStatus, PoolError, WorkerPool};
