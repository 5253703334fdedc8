//! Replace the local annotations of an exercise
//!
//! Annotations belong to the application. Imports never touch them, so a
//! value set here survives every later library update.

use mediator::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ingest::{library::Exercise, ExerciseLibrary, LibraryError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAnnotationsCommand {
    pub external_id: String,
    pub annotations: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SetAnnotationsError {
    #[error("Annotations must be a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Library(#[from] LibraryError),
}

impl Request<Result<Exercise, SetAnnotationsError>> for SetAnnotationsCommand {}

impl SetAnnotationsCommand {
    pub fn validate(&self) -> Result<(), SetAnnotationsError> {
        if self.annotations.is_object() {
            Ok(())
        } else {
            Err(SetAnnotationsError::NotAnObject)
        }
    }
}

#[tracing::instrument(skip(library, command), fields(external_id = %command.external_id))]
pub async fn handle(
    library: &dyn ExerciseLibrary,
    command: SetAnnotationsCommand,
) -> Result<Exercise, SetAnnotationsError> {
    command.validate()?;

    library
        .set_annotations(&command.external_id, command.annotations)
        .await?
        .ok_or(SetAnnotationsError::Library(LibraryError::NotFound(command.external_id)))
}
