use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::ingest::{library::Exercise, ExerciseLibrary, LibraryError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetExerciseQuery {
    pub external_id: String,
}

impl Request<Result<Exercise, LibraryError>> for GetExerciseQuery {}

pub async fn handle(
    library: &dyn ExerciseLibrary,
    query: GetExerciseQuery,
) -> Result<Exercise, LibraryError> {
    library
        .find(&query.external_id)
        .await?
        .ok_or(LibraryError::NotFound(query.external_id))
}
