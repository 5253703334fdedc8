//! Job commands

pub mod deploy;

pub use deploy::{DeployJobCommand, DeployJobResponse};
