//! Memory ingestion, relation-graph shaping and hybrid search over captured
//! text, partitioned by owner.
//!
//! A capture (raw text plus optional URL, title and metadata facets) is
//! canonicalized, checked for duplicates and stored. In the background it is
//! embedded and scored against the owner's other memories on three signals
//! (semantic, topical, temporal); the candidate edges are shaped into a
//! sparse graph with mutual k-nearest-neighbor pruning and a degree cap.
//! Search blends BM25 and vector similarity and can synthesize a short cited
//! answer.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search,
//!   partitioned by owner
//! - **Embeddings**: any OpenAI-compatible `/embeddings` endpoint, wrapped so
//!   that a failure falls back to a deterministic hashed vector
//! - **Search**: `0.4·keyword + 0.6·semantic` blend with noise floors
//! - **Pipeline**: bounded tokio worker pool with retry/backoff
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema and migrations
//! - [`embedding`]: Embedding providers and the never-failing fallback wrapper
//! - [`memory`]: Canonicalization, dedup, relation scoring and shaping, search
//! - [`pipeline`]: Worker pool and TTL cache
//! - [`synthesis`]: Optional cited-answer synthesis
//! - [`engine`]: The operations exposed to callers

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod memory;
pub mod pipeline;
pub mod synthesis;

pub use engine::{Engine, IngestReceipt};
