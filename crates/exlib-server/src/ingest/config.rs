//! Import job configuration
//!
//! Where the dataset lives and how runs are supervised. Everything here
//! is process configuration: the deploy trigger itself takes no input.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::fetcher::SourceReference;
use super::reconciler::{DEFAULT_LIVENESS_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use super::runner::{
    RunnerConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_CONSECUTIVE_STORAGE_FAILURES,
    DEFAULT_PROGRESS_FLUSH_EVERY, MAX_DIAGNOSTICS,
};

/// Public free-exercise-db dataset
pub const DEFAULT_IMPORT_SOURCE: &str =
    "https://raw.githubusercontent.com/yuhonas/free-exercise-db/main/dist/exercises.json";

/// Image paths in the public dataset are relative to this
pub const DEFAULT_MEDIA_BASE_URL: &str =
    "https://raw.githubusercontent.com/yuhonas/free-exercise-db/main/exercises";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// `s3://key`, `http(s)://...` or `file://path`
    pub source: String,
    pub media_base_url: Option<String>,
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub progress_flush_every: u64,
    pub max_failure_ratio: Option<f64>,
    pub max_consecutive_storage_failures: u32,
    pub channel_capacity: usize,
    pub fetch_connect_timeout_secs: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_IMPORT_SOURCE.to_string(),
            media_base_url: Some(DEFAULT_MEDIA_BASE_URL.to_string()),
            liveness_timeout_secs: DEFAULT_LIVENESS_TIMEOUT.as_secs(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            progress_flush_every: DEFAULT_PROGRESS_FLUSH_EVERY,
            max_failure_ratio: None,
            max_consecutive_storage_failures: DEFAULT_MAX_CONSECUTIVE_STORAGE_FAILURES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            fetch_connect_timeout_secs: 30,
        }
    }
}

impl ImportConfig {
    /// Load from `EXLIB_IMPORT_*` and `EXLIB_JOB_*` variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let max_failure_ratio = match std::env::var("EXLIB_JOB_MAX_FAILURE_RATIO") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<f64>().map_err(|e| {
                anyhow::anyhow!("Invalid EXLIB_JOB_MAX_FAILURE_RATIO '{}': {}", raw, e)
            })?),
            _ => None,
        };

        Ok(Self {
            source: std::env::var("EXLIB_IMPORT_SOURCE").unwrap_or(defaults.source),
            media_base_url: match std::env::var("EXLIB_IMPORT_MEDIA_BASE_URL") {
                Ok(url) if url.trim().is_empty() => None,
                Ok(url) => Some(url),
                Err(_) => defaults.media_base_url,
            },
            liveness_timeout_secs: env_or("EXLIB_JOB_LIVENESS_TIMEOUT_SECS", defaults.liveness_timeout_secs)?,
            sweep_interval_secs: env_or("EXLIB_JOB_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            progress_flush_every: env_or("EXLIB_JOB_PROGRESS_FLUSH_EVERY", defaults.progress_flush_every)?,
            max_failure_ratio,
            max_consecutive_storage_failures: env_or(
                "EXLIB_JOB_MAX_CONSECUTIVE_STORAGE_FAILURES",
                defaults.max_consecutive_storage_failures,
            )?,
            channel_capacity: env_or("EXLIB_JOB_CHANNEL_CAPACITY", defaults.channel_capacity)?,
            fetch_connect_timeout_secs: env_or(
                "EXLIB_IMPORT_CONNECT_TIMEOUT_SECS",
                defaults.fetch_connect_timeout_secs,
            )?,
        })
    }

    pub fn source_reference(&self) -> anyhow::Result<SourceReference> {
        Ok(self.source.parse::<SourceReference>()?)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn fetch_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_connect_timeout_secs)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            progress_flush_every: self.progress_flush_every,
            max_failure_ratio: self.max_failure_ratio,
            max_consecutive_storage_failures: self.max_consecutive_storage_failures,
            channel_capacity: self.channel_capacity,
            max_diagnostics: MAX_DIAGNOSTICS,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.source_reference()?;

        if self.liveness_timeout_secs == 0 {
            anyhow::bail!("EXLIB_JOB_LIVENESS_TIMEOUT_SECS must be greater than 0");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("EXLIB_JOB_SWEEP_INTERVAL_SECS must be greater than 0");
        }
        if self.progress_flush_every == 0 {
            anyhow::bail!("EXLIB_JOB_PROGRESS_FLUSH_EVERY must be greater than 0");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("EXLIB_JOB_CHANNEL_CAPACITY must be greater than 0");
        }
        if let Some(ratio) = self.max_failure_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                anyhow::bail!("EXLIB_JOB_MAX_FAILURE_RATIO must be between 0.0 and 1.0");
            }
        }
        Ok(())
    }
}

/// Parse `key` when set, otherwise `default`; an unparsable value is an error
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}
