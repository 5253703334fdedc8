//! Exercises feature module
//!
//! Read access to the imported library, plus the one write the
//! application owns: local annotations.

pub mod commands;
pub mod queries;
pub mod routes;

pub use routes::exercises_routes;
