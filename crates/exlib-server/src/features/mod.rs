//! HTTP feature slices
//!
//! Each feature keeps its write operations in `commands/`, its reads in
//! `queries/` and the axum wiring in `routes.rs`.
//!
//! Every command and query is a `mediator::Request` whose response type is
//! the `Result` its `handle` function returns, so the slice signature can
//! be read off the type alone.
//!
//! - **jobs**: deploy trigger, job status and job listing
//! - **exercises**: library reads and local annotations

pub mod exercises;
pub mod jobs;

use axum::Router;
use std::sync::Arc;

use crate::ingest::{ExerciseLibrary, JobRegistry};

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub registry: Arc<JobRegistry>,
    pub library: Arc<dyn ExerciseLibrary>,
}

/// Router with every feature mounted under its own prefix
///
/// - `/jobs` - deploy and inspect background jobs
/// - `/exercises` - the exercise library
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .nest("/jobs", jobs::jobs_routes().with_state(state.registry))
        .nest("/exercises", exercises::exercises_routes().with_state(state.library))
}
