//! Exercise library server
//!
//! Keeps a local exercise library in sync with a published dataset. The
//! sync runs as a background job: an HTTP trigger creates the job record,
//! a runner streams the dataset from storage, parses it element by element
//! and upserts every record, and the job record tracks progress and the
//! final outcome.
//!
//! # Modules
//!
//! - [`ingest`]: job records, fetchers, the streaming parser, the upsert
//!   engine, the runner, the dispatcher and the stale-run sweep
//! - [`features`]: HTTP routes under `/api/v1`
//! - [`storage`]: S3-compatible object storage client
//! - [`config`]: environment-based configuration

pub mod config;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;
pub mod storage;

pub use error::AppError;
