//! Background import jobs
//!
//! The pieces of the "update exercise library" job, bottom-up:
//!
//! - [`jobs`]: kinds, statuses, progress counters and the job record
//! - [`store`]: durable job records with an atomic create-if-absent
//! - [`fetcher`]: streams the dataset from S3, HTTP or a local file
//! - [`parser`]: incremental JSON-array parser with per-record errors
//! - [`library`]: exercise store and the idempotent upsert engine
//! - [`runner`]: fetch -> parse -> upsert pipeline for one job
//! - [`dispatcher`]: `deploy(kind)` and the runner registry
//! - [`reconciler`]: periodic sweep of runs that stopped making progress
//!
//! [`memory`] holds in-memory implementations of the store, library and
//! fetcher seams.

pub mod config;
pub mod dispatcher;
pub mod exercise;
pub mod fetcher;
pub mod jobs;
pub mod library;
pub mod memory;
pub mod parser;
pub mod reconciler;
pub mod runner;
pub mod store;

pub use config::ImportConfig;
pub use dispatcher::{DeployOutcome, DispatchError, JobRegistry};
pub use fetcher::{BlobFetcher, FetchError, SourceFetcher, SourceReference};
pub use jobs::{JobFilter, JobKind, JobProgress, JobRecord, JobStatus, RecordDiagnostic};
pub use library::{ExerciseLibrary, LibraryError, PgExerciseLibrary, UpsertEngine, UpsertOutcome};
pub use reconciler::StaleJobSweeper;
pub use runner::{JobRunner, RunError, RunnerConfig};
pub use store::{JobStore, JobStoreError, PgJobStore};
