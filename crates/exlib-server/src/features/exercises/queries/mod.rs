pub mod get_exercise;
pub mod list_exercises;

pub use get_exercise::GetExerciseQuery;
pub use list_exercises::{ListExercisesQuery, ListExercisesResponse};
