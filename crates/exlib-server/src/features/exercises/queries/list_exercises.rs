//! List exercises query, ordered by external id

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::ingest::{library::Exercise, ExerciseLibrary, LibraryError};

pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListExercisesQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListExercisesResponse {
    pub exercises: Vec<Exercise>,
    pub limit: i64,
    pub offset: i64,
}

impl Request<Result<ListExercisesResponse, LibraryError>> for ListExercisesQuery {}

impl ListExercisesQuery {
    fn paging(&self) -> (i64, i64) {
        let limit = match self.limit {
            Some(limit) if limit > 0 => limit.min(MAX_PAGE_SIZE),
            _ => DEFAULT_PAGE_SIZE,
        };
        (limit, self.offset.unwrap_or(0).max(0))
    }
}

pub async fn handle(
    library: &dyn ExerciseLibrary,
    query: ListExercisesQuery,
) -> Result<ListExercisesResponse, LibraryError> {
    let (limit, offset) = query.paging();
    let exercises = library.list(limit, offset).await?;

    Ok(ListExercisesResponse {
        exercises,
        limit,
        offset,
    })
}
