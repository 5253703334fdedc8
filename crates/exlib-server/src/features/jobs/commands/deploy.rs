//! Deploy job command
//!
//! Triggers a background job of the given kind. Returns as soon as the job
//! record exists; the import runs on its own task and its outcome is only
//! visible through the job status query.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ingest::{DeployOutcome, DispatchError, JobKind, JobRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployJobCommand {
    pub kind: JobKind,
}

/// Response body for both accepted and rejected deploys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployJobResponse {
    pub job_id: Option<Uuid>,
    pub kind: JobKind,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeployJobResponse {
    pub fn from_outcome(kind: JobKind, outcome: &DeployOutcome) -> Self {
        match outcome {
            DeployOutcome::Accepted(job_id) => Self {
                job_id: Some(*job_id),
                kind,
                accepted: true,
                error: None,
            },
            DeployOutcome::RejectedAlreadyRunning(existing) => Self {
                job_id: *existing,
                kind,
                accepted: false,
                error: Some(format!("A {} job is already queued or running", kind)),
            },
        }
    }
}

impl Request<Result<DeployOutcome, DispatchError>> for DeployJobCommand {}

#[tracing::instrument(skip(registry))]
pub async fn handle(
    registry: &JobRegistry,
    command: DeployJobCommand,
) -> Result<DeployOutcome, DispatchError> {
    registry.deploy(command.kind).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_response_carries_existing_id() {
        let existing = Uuid::new_v4();
        let response = DeployJobResponse::from_outcome(
            JobKind::UpdateExerciseLibrary,
            &DeployOutcome::RejectedAlreadyRunning(Some(existing)),
        );
        assert!(!response.accepted);
        assert_eq!(response.job_id, Some(existing));
        assert!(response.error.unwrap().contains("already"));
    }

    #[test]
    fn test_accepted_response_has_no_error() {
        let id = Uuid::new_v4();
        let response =
            DeployJobResponse::from_outcome(JobKind::UpdateExerciseLibrary, &DeployOutcome::Accepted(id));
        assert!(response.accepted);
        assert_eq!(response.job_id, Some(id));
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("error").is_none());
    }
}
