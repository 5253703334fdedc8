//! Job runner: drives one import from `Queued` to a terminal status
//!
//! The pipeline is a producer task (fetch + parse) feeding a bounded
//! channel and a consumer loop (upsert + progress). Whatever happens in
//! between, the record ends terminal with `finished_at` set: fatal errors
//! and panics are caught and written as `Failed`.

use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::exercise::Normalizer;
use super::fetcher::{BlobFetcher, FetchError, SourceReference};
use super::jobs::{JobOutcome, JobProgress, JobStatus, RecordDiagnostic};
use super::library::{UpsertEngine, UpsertOutcome};
use super::parser::{DatasetParser, FatalParseError, ParsedItem, SourceError};
use super::store::{JobStore, JobStoreError};

pub const DEFAULT_PROGRESS_FLUSH_EVERY: u64 = 100;
pub const DEFAULT_MAX_CONSECUTIVE_STORAGE_FAILURES: u32 = 5;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const MAX_DIAGNOSTICS: usize = 100;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Dataset unreadable: {0}")]
    Parse(#[from] FatalParseError),

    #[error("Library storage failing: {consecutive} consecutive write failures, last error: {last}")]
    StorageOutage { consecutive: u32, last: String },

    #[error("Job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("Job {0} is no longer live")]
    Superseded(Uuid),

    #[error("Job {0} was not queued")]
    NotQueued(Uuid),

    #[error("Import task panicked: {0}")]
    Panicked(String),
}

impl From<SourceError> for RunError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Fetch(e) => RunError::Fetch(e),
            SourceError::Parse(e) => RunError::Parse(e),
        }
    }
}

/// Tuning and failure policy for a run
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Persist progress after this many items
    pub progress_flush_every: u64,
    /// Fail the job when the failed share exceeds this ratio; `None`
    /// fails only when records failed and none succeeded
    pub max_failure_ratio: Option<f64>,
    /// Consecutive upsert failures treated as a storage outage
    pub max_consecutive_storage_failures: u32,
    pub channel_capacity: usize,
    pub max_diagnostics: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            progress_flush_every: DEFAULT_PROGRESS_FLUSH_EVERY,
            max_failure_ratio: None,
            max_consecutive_storage_failures: DEFAULT_MAX_CONSECUTIVE_STORAGE_FAILURES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_diagnostics: MAX_DIAGNOSTICS,
        }
    }
}

impl RunnerConfig {
    /// Failure detail when a completed import still counts as failed
    pub fn verdict(&self, progress: &JobProgress) -> Option<String> {
        if progress.items_failed == 0 {
            return None;
        }

        let failed = match self.max_failure_ratio {
            Some(ratio) => progress.failure_ratio() > ratio,
            None => progress.succeeded() == 0,
        };

        failed.then(|| {
            format!(
                "{} of {} records failed (failure ratio {:.2})",
                progress.items_failed,
                progress.items_fetched,
                progress.failure_ratio()
            )
        })
    }
}

/// Counters and diagnostics of the run in progress
#[derive(Debug, Default)]
struct RunTracker {
    progress: JobProgress,
    diagnostics: Vec<RecordDiagnostic>,
    max_diagnostics: usize,
    unflushed: u64,
}

impl RunTracker {
    fn new(max_diagnostics: usize) -> Self {
        Self {
            max_diagnostics,
            ..Default::default()
        }
    }

    fn record_failure(&mut self, diagnostic: RecordDiagnostic) {
        self.progress.inc_failed();
        if self.diagnostics.len() < self.max_diagnostics {
            self.diagnostics.push(diagnostic);
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn BlobFetcher>,
    engine: UpsertEngine,
    source: SourceReference,
    normalizer: Normalizer,
    config: RunnerConfig,
    worker_host: String,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn BlobFetcher>,
        engine: UpsertEngine,
        source: SourceReference,
        normalizer: Normalizer,
        config: RunnerConfig,
    ) -> Self {
        let worker_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            store,
            fetcher,
            engine,
            source,
            normalizer,
            config,
            worker_host,
        }
    }

    /// Run a queued job to completion and return its terminal status
    #[instrument(skip(self), fields(job_id = %job_id, source = %self.source))]
    pub async fn run(&self, job_id: Uuid) -> Result<JobStatus, RunError> {
        match self.store.mark_running(job_id, &self.worker_host).await {
            Ok(true) => {},
            Ok(false) => {
                warn!("Job is not queued, refusing to run");
                return Err(RunError::NotQueued(job_id));
            },
            Err(e) => {
                error!(error = %e, "Failed to mark job running");
                self.finish(job_id, JobOutcome::failed(e.to_string(), None, None))
                    .await?;
                return Err(e.into());
            },
        }

        info!(worker_host = %self.worker_host, "Import started");

        let this = self.clone();
        let pipeline = tokio::spawn(async move { this.execute(job_id).await });

        let outcome = match pipeline.await {
            Ok((tracker, Ok(()))) => match self.config.verdict(&tracker.progress) {
                None => JobOutcome::succeeded(tracker.progress, tracker.diagnostics),
                Some(detail) => {
                    JobOutcome::failed(detail, Some(tracker.progress), Some(tracker.diagnostics))
                },
            },
            Ok((tracker, Err(e))) => {
                error!(error = %e, "Import failed");
                JobOutcome::failed(e.to_string(), Some(tracker.progress), Some(tracker.diagnostics))
            },
            Err(join_err) => {
                error!(error = %join_err, "Import task aborted");
                JobOutcome::failed(RunError::Panicked(join_err.to_string()).to_string(), None, None)
            },
        };

        let status = outcome.status;
        self.finish(job_id, outcome).await?;
        Ok(status)
    }

    async fn finish(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), RunError> {
        let written = self.store.finish(job_id, &outcome).await?;
        let progress = outcome.progress.unwrap_or_default();

        if written {
            info!(
                status = %outcome.status,
                fetched = progress.items_fetched,
                upserted = progress.items_upserted,
                skipped = progress.items_skipped,
                failed = progress.items_failed,
                "Import finished"
            );
        } else {
            warn!(
                status = %outcome.status,
                "Job already terminal (stale sweep?), result not recorded"
            );
        }
        Ok(())
    }

    async fn execute(&self, job_id: Uuid) -> (RunTracker, Result<(), RunError>) {
        let mut tracker = RunTracker::new(self.config.max_diagnostics);
        let result = self.pipeline(job_id, &mut tracker).await;
        (tracker, result)
    }

    async fn pipeline(&self, job_id: Uuid, tracker: &mut RunTracker) -> Result<(), RunError> {
        let bytes = self.fetcher.fetch(&self.source).await?;
        let mut items = DatasetParser::new(self.normalizer.clone()).parse_stream(bytes);

        let (tx, mut rx) = mpsc::channel::<ParsedItem>(self.config.channel_capacity.max(1));
        let producer = tokio::spawn(async move {
            while let Some(item) = items.next().await {
                if tx.send(item?).await.is_err() {
                    break;
                }
            }
            Ok::<(), RunError>(())
        });

        let max_consecutive = self.config.max_consecutive_storage_failures.max(1);
        let mut consecutive_failures = 0u32;

        while let Some(item) = rx.recv().await {
            tracker.progress.inc_fetched();

            match item {
                ParsedItem::Invalid(err) => {
                    debug!(index = err.index, external_id = ?err.external_id, reason = %err.message, "Record rejected");
                    tracker.record_failure(err.diagnostic());
                },
                ParsedItem::Record { index, record } => {
                    match self.engine.upsert(&record, job_id).await {
                        Ok(UpsertOutcome::Inserted | UpsertOutcome::Updated { .. }) => {
                            consecutive_failures = 0;
                            tracker.progress.inc_upserted();
                        },
                        Ok(UpsertOutcome::Unchanged) => {
                            consecutive_failures = 0;
                            tracker.progress.inc_skipped();
                        },
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(index, external_id = %record.external_id, error = %e, "Upsert failed");
                            tracker.record_failure(RecordDiagnostic {
                                index,
                                external_id: Some(record.external_id.clone()),
                                message: e.to_string(),
                            });

                            if consecutive_failures >= max_consecutive {
                                producer.abort();
                                return Err(RunError::StorageOutage {
                                    consecutive: consecutive_failures,
                                    last: e.to_string(),
                                });
                            }
                        },
                    }
                },
            }

            tracker.unflushed += 1;
            if tracker.unflushed >= self.config.progress_flush_every.max(1) {
                self.flush(job_id, tracker).await?;
            }
        }

        match producer.await {
            Ok(result) => result?,
            Err(join_err) => return Err(RunError::Panicked(join_err.to_string())),
        }

        if tracker.unflushed > 0 {
            self.flush(job_id, tracker).await?;
        }
        Ok(())
    }

    async fn flush(&self, job_id: Uuid, tracker: &mut RunTracker) -> Result<(), RunError> {
        tracker.unflushed = 0;
        match self
            .store
            .record_progress(job_id, &tracker.progress, &tracker.diagnostics)
            .await
        {
            Ok(true) => {
                debug!(
                    fetched = tracker.progress.items_fetched,
                    failed = tracker.progress.items_failed,
                    "Progress recorded"
                );
                Ok(())
            },
            Ok(false) => Err(RunError::Superseded(job_id)),
            Err(e) => {
                // counters are written again on the next flush and at finish
                warn!(error = %e, "Progress flush failed");
                Ok(())
            },
        }
    }
}
