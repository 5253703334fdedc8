//! Exlib Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error type and logging bootstrap for the exlib workspace.
//!
//! # Example
//!
//! ```no_run
//! use exlib_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{ExlibError, Result};
