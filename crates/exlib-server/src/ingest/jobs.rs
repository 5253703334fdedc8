//! Job definitions for library imports
//!
//! Kinds, statuses, progress counters and the durable job record shape
//! shared by the store, the runner and the HTTP layer.

use chrono::{DateTime, Utc};
use exlib_common::ExlibError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of background job
///
/// Exactly one kind exists today; the registry keys runners by kind so a
/// second one only needs a new variant and a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Re-populate the exercise library from the configured dataset
    UpdateExerciseLibrary,
}

impl JobKind {
    pub const ALL: [JobKind; 1] = [JobKind::UpdateExerciseLibrary];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::UpdateExerciseLibrary => "update_exercise_library",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = ExlibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ExlibError::UnknownJobKind(s.to_string()))
    }
}

/// Lifecycle state of a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Queued or running: holds the exclusivity slot for its kind
    pub fn is_live(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// No further transition happens from a terminal status
    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ExlibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ExlibError::UnknownJobStatus(other.to_string())),
        }
    }
}

/// Progress counters; only ever increase over a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobProgress {
    /// Items read from the source, parsed or not
    pub items_fetched: i64,
    /// Records inserted or updated in the library
    pub items_upserted: i64,
    /// Records already identical in the library
    pub items_skipped: i64,
    /// Records that failed to parse or to store
    pub items_failed: i64,
}

impl JobProgress {
    pub fn inc_fetched(&mut self) {
        self.items_fetched += 1;
    }

    pub fn inc_upserted(&mut self) {
        self.items_upserted += 1;
    }

    pub fn inc_skipped(&mut self) {
        self.items_skipped += 1;
    }

    pub fn inc_failed(&mut self) {
        self.items_failed += 1;
    }

    /// Records that reached the library in a consistent state
    pub fn succeeded(&self) -> i64 {
        self.items_upserted + self.items_skipped
    }

    /// Share of fetched items that failed, 0.0 when nothing was fetched
    pub fn failure_ratio(&self) -> f64 {
        if self.items_fetched > 0 {
            self.items_failed as f64 / self.items_fetched as f64
        } else {
            0.0
        }
    }

    /// Field-wise max, so a stale writer can never move a counter backwards
    pub fn max(self, other: Self) -> Self {
        Self {
            items_fetched: self.items_fetched.max(other.items_fetched),
            items_upserted: self.items_upserted.max(other.items_upserted),
            items_skipped: self.items_skipped.max(other.items_skipped),
            items_failed: self.items_failed.max(other.items_failed),
        }
    }
}

/// Identity and reason for one failed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDiagnostic {
    /// Zero-based position of the item in the source array
    pub index: u64,
    pub external_id: Option<String>,
    pub message: String,
}

/// Durable record of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    /// Present only when `status` is `Failed`
    pub error_detail: Option<String>,
    pub diagnostics: Vec<RecordDiagnostic>,
    pub worker_host: Option<String>,
}

impl JobRecord {
    /// Fresh queued record for `kind`
    pub fn queued(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_progress_at: None,
            progress: JobProgress::default(),
            error_detail: None,
            diagnostics: Vec::new(),
            worker_host: None,
        }
    }

    /// Instant the liveness timeout is measured from
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        match self.status {
            JobStatus::Queued => self.created_at,
            _ => self
                .last_progress_at
                .or(self.started_at)
                .unwrap_or(self.created_at),
        }
    }
}

/// Terminal write performed by the runner (or the stale sweep)
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub error_detail: Option<String>,
    /// `None` keeps whatever counters were last flushed
    pub progress: Option<JobProgress>,
    pub diagnostics: Option<Vec<RecordDiagnostic>>,
}

impl JobOutcome {
    pub fn succeeded(progress: JobProgress, diagnostics: Vec<RecordDiagnostic>) -> Self {
        Self {
            status: JobStatus::Succeeded,
            error_detail: None,
            progress: Some(progress),
            diagnostics: Some(diagnostics),
        }
    }

    pub fn failed(
        detail: impl Into<String>,
        progress: Option<JobProgress>,
        diagnostics: Option<Vec<RecordDiagnostic>>,
    ) -> Self {
        Self {
            status: JobStatus::Failed,
            error_detail: Some(detail.into()),
            progress,
            diagnostics,
        }
    }
}

/// Filter for listing job records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 500;

    /// Clamp paging values into the accepted range
    pub fn normalized(mut self) -> Self {
        if self.limit <= 0 {
            self.limit = Self::DEFAULT_LIMIT;
        }
        self.limit = self.limit.min(Self::MAX_LIMIT);
        self.offset = self.offset.max(0);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.kind.map_or(true, |kind| record.kind == kind)
            && self.status.map_or(true, |status| record.status == status)
    }
}
