//! Exercise routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;

use super::{
    commands::{set_annotations, SetAnnotationsCommand, SetAnnotationsError},
    queries::{get_exercise, list_exercises, GetExerciseQuery, ListExercisesQuery},
};
use crate::{error::AppError, ingest::ExerciseLibrary};

pub fn exercises_routes() -> Router<Arc<dyn ExerciseLibrary>> {
    Router::new()
        .route("/", get(list_exercises_handler))
        .route("/:external_id", get(get_exercise_handler))
        .route("/:external_id/annotations", put(set_annotations_handler))
}

async fn list_exercises_handler(
    State(library): State<Arc<dyn ExerciseLibrary>>,
    Query(query): Query<ListExercisesQuery>,
) -> Result<Response, AppError> {
    let response = list_exercises::handle(library.as_ref(), query).await?;
    Ok((StatusCode::OK, Json(response)).into_response())
}

async fn get_exercise_handler(
    State(library): State<Arc<dyn ExerciseLibrary>>,
    Path(external_id): Path<String>,
) -> Result<Response, AppError> {
    let exercise = get_exercise::handle(library.as_ref(), GetExerciseQuery { external_id }).await?;
    Ok((StatusCode::OK, Json(exercise)).into_response())
}

async fn set_annotations_handler(
    State(library): State<Arc<dyn ExerciseLibrary>>,
    Path(external_id): Path<String>,
    Json(annotations): Json<Value>,
) -> Result<Response, AppError> {
    let command = SetAnnotationsCommand {
        external_id,
        annotations,
    };

    match set_annotations::handle(library.as_ref(), command).await {
        Ok(exercise) => Ok((StatusCode::OK, Json(exercise)).into_response()),
        Err(SetAnnotationsError::NotAnObject) => Err(AppError::BadRequest(
            "Annotations must be a JSON object".to_string(),
        )),
        Err(SetAnnotationsError::Library(e)) => Err(e.into()),
    }
}
