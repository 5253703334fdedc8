//! Job registry and dispatcher
//!
//! `deploy` is the only way a job comes to life. It performs the atomic
//! create-if-absent against the job store and, when accepted, hands the new
//! record to the kind's runner on a background task. The caller gets the
//! job id back immediately and never waits for the import.

use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use super::jobs::JobKind;
use super::runner::JobRunner;
use super::store::{CreateOutcome, JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No runner registered for job kind {0}")]
    UnknownKind(JobKind),

    #[error("Registry is shutting down, not accepting new jobs")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Synchronous answer to a deploy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Accepted(Uuid),
    /// A live job of the same kind exists; carries its id when known
    RejectedAlreadyRunning(Option<Uuid>),
}

pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    runners: HashMap<JobKind, JobRunner>,
    tasks: TaskTracker,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            runners: HashMap::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn register(mut self, kind: JobKind, runner: JobRunner) -> Self {
        self.runners.insert(kind, runner);
        self
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Trigger a job of `kind`
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn deploy(&self, kind: JobKind) -> Result<DeployOutcome, DispatchError> {
        if self.tasks.is_closed() {
            warn!("Deploy refused during shutdown");
            return Err(DispatchError::ShuttingDown);
        }

        let runner = self
            .runners
            .get(&kind)
            .cloned()
            .ok_or(DispatchError::UnknownKind(kind))?;

        match self.store.create_if_absent(kind).await? {
            CreateOutcome::AlreadyLive(existing) => {
                info!(existing = ?existing, "Deploy rejected, job already live");
                Ok(DeployOutcome::RejectedAlreadyRunning(existing))
            },
            CreateOutcome::Created(record) => {
                let job_id = record.id;
                info!(job_id = %job_id, "Job accepted");

                self.tasks.spawn(
                    async move {
                        match runner.run(job_id).await {
                            Ok(status) => info!(status = %status, "Job runner exited"),
                            Err(e) => error!(error = %e, "Job runner exited with error"),
                        }
                    }
                    .instrument(info_span!("job", job_id = %job_id, kind = %kind)),
                );

                Ok(DeployOutcome::Accepted(job_id))
            },
        }
    }

    /// Number of runner tasks still executing
    pub fn active_runs(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting work and wait up to `timeout` for running jobs
    ///
    /// Later `deploy` calls fail with [`DispatchError::ShuttingDown`].
    /// Jobs still running afterwards stay `Running` in the store and are
    /// reclaimed by the stale sweep.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(active = self.tasks.len(), "Shutdown timeout reached with jobs still running");
        }
    }
}
