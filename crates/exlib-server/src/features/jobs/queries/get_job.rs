//! Get job query
//!
//! Snapshot of one job record: status, counters, error detail and the
//! record-level diagnostics collected so far.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ingest::{JobRecord, JobStore, JobStoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetJobQuery {
    pub job_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum GetJobError {
    #[error("Job not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl Request<Result<JobRecord, GetJobError>> for GetJobQuery {}

pub async fn handle(store: &dyn JobStore, query: GetJobQuery) -> Result<JobRecord, GetJobError> {
    store.get(query.job_id).await?.ok_or(GetJobError::NotFound)
}
