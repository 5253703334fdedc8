//! Job routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    commands::{deploy, DeployJobCommand, DeployJobResponse},
    queries::{get_job, list_jobs, GetJobError, GetJobQuery, ListJobsError, ListJobsQuery},
};
use crate::{
    error::AppError,
    ingest::{DeployOutcome, JobKind, JobRegistry},
};

pub fn jobs_routes() -> Router<Arc<JobRegistry>> {
    Router::new()
        .route("/", get(list_jobs_handler))
        .route("/:job_id", get(get_job_handler))
        .route("/deploy/:kind", post(deploy_handler))
}

async fn deploy_handler(
    State(registry): State<Arc<JobRegistry>>,
    Path(kind): Path<String>,
) -> Result<Response, AppError> {
    let kind: JobKind = kind
        .parse()
        .map_err(|_| AppError::NotFound(format!("Unknown job kind '{}'", kind)))?;

    let outcome = deploy::handle(&registry, DeployJobCommand { kind }).await?;
    let body = DeployJobResponse::from_outcome(kind, &outcome);

    let status = match outcome {
        DeployOutcome::Accepted(_) => StatusCode::ACCEPTED,
        DeployOutcome::RejectedAlreadyRunning(_) => StatusCode::CONFLICT,
    };

    Ok((status, Json(body)).into_response())
}

async fn get_job_handler(
    State(registry): State<Arc<JobRegistry>>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job_id = Uuid::parse_str(&job_id)
        .map_err(|_| AppError::BadRequest(format!("Invalid job id '{}'", job_id)))?;

    let store = registry.store();
    match get_job::handle(store.as_ref(), GetJobQuery { job_id }).await {
        Ok(job) => Ok((StatusCode::OK, Json(json!(job))).into_response()),
        Err(GetJobError::NotFound) => Err(AppError::NotFound(format!("Job {} not found", job_id))),
        Err(GetJobError::Store(e)) => Err(e.into()),
    }
}

async fn list_jobs_handler(
    State(registry): State<Arc<JobRegistry>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Response, AppError> {
    let store = registry.store();
    match list_jobs::handle(store.as_ref(), query).await {
        Ok(response) => Ok((StatusCode::OK, Json(response)).into_response()),
        Err(ListJobsError::InvalidFilter(message)) => Err(AppError::BadRequest(message)),
        Err(ListJobsError::Store(e)) => Err(e.into()),
    }
}
