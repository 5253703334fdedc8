//! List jobs query
//!
//! Recent job records, newest first, optionally filtered by kind and status.

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::ingest::{JobFilter, JobKind, JobRecord, JobStatus, JobStore, JobStoreError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobsQuery {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobRecord>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ListJobsError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl Request<Result<ListJobsResponse, ListJobsError>> for ListJobsQuery {}

impl ListJobsQuery {
    pub fn filter(&self) -> Result<JobFilter, ListJobsError> {
        let kind = self
            .kind
            .as_deref()
            .map(str::parse::<JobKind>)
            .transpose()
            .map_err(|e| ListJobsError::InvalidFilter(e.to_string()))?;
        let status = self
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()
            .map_err(|e| ListJobsError::InvalidFilter(e.to_string()))?;

        Ok(JobFilter {
            kind,
            status,
            limit: self.limit.unwrap_or(JobFilter::DEFAULT_LIMIT),
            offset: self.offset.unwrap_or(0),
        }
        .normalized())
    }
}

pub async fn handle(
    store: &dyn JobStore,
    query: ListJobsQuery,
) -> Result<ListJobsResponse, ListJobsError> {
    let filter = query.filter()?;
    let jobs = store.list(&filter).await?;

    Ok(ListJobsResponse {
        jobs,
        limit: filter.limit,
        offset: filter.offset,
    })
}
