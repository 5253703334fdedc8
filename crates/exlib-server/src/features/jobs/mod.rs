//! Jobs feature module
//!
//! Deploy trigger and read access to job records. The deploy route takes
//! no body: what a job does is fixed by configuration.

pub mod commands;
pub mod queries;
pub mod routes;


pub use routes::jobs_routes;
