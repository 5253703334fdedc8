//! Durable job record store
//!
//! The store is the only place the exclusivity invariant lives: creating a
//! queued record for a kind that already has a live one is rejected by the
//! store itself, atomically, so two processes racing on the same trigger
//! can never both win.
//!
//! The Postgres implementation leans on the partial unique index
//! `uq_import_jobs_live_kind`; a unique violation on insert means a live
//! record already exists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::jobs::{
    JobFilter, JobKind, JobOutcome, JobProgress, JobRecord, JobStatus, RecordDiagnostic,
};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

/// Result of an atomic create-if-absent
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(JobRecord),
    /// A live record already holds the kind; its id when still visible
    AlreadyLive(Option<Uuid>),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued record for `kind` unless a live one exists
    async fn create_if_absent(&self, kind: JobKind) -> Result<CreateOutcome, JobStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, JobStoreError>;

    /// Newest first
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError>;

    /// `Queued -> Running`; false when the record is not queued anymore
    async fn mark_running(&self, id: Uuid, worker_host: &str) -> Result<bool, JobStoreError>;

    /// Persist counters and diagnostics of a running job; false when the
    /// record is no longer running (swept or finished elsewhere)
    async fn record_progress(
        &self,
        id: Uuid,
        progress: &JobProgress,
        diagnostics: &[RecordDiagnostic],
    ) -> Result<bool, JobStoreError>;

    /// Move a live record to a terminal status; false when it was already terminal
    async fn finish(&self, id: Uuid, outcome: &JobOutcome) -> Result<bool, JobStoreError>;

    /// Fail every live record whose last activity is older than `cutoff`
    async fn sweep_stale(
        &self,
        cutoff: DateTime<Utc>,
        detail: &str,
    ) -> Result<Vec<Uuid>, JobStoreError>;
}

const JOB_COLUMNS: &str = "id, kind, status, created_at, started_at, finished_at, \
     last_progress_at, items_fetched, items_upserted, items_skipped, items_failed, \
     error_detail, diagnostics, worker_host";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_progress_at: Option<DateTime<Utc>>,
    items_fetched: i64,
    items_upserted: i64,
    items_skipped: i64,
    items_failed: i64,
    error_detail: Option<String>,
    diagnostics: Json<Vec<RecordDiagnostic>>,
    worker_host: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| JobStoreError::Corrupt { id: row.id, reason };
        let kind: JobKind = row
            .kind
            .parse()
            .map_err(|e: exlib_common::ExlibError| corrupt(e.to_string()))?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: exlib_common::ExlibError| corrupt(e.to_string()))?;

        Ok(JobRecord {
            id: row.id,
            kind,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_progress_at: row.last_progress_at,
            progress: JobProgress {
                items_fetched: row.items_fetched,
                items_upserted: row.items_upserted,
                items_skipped: row.items_skipped,
                items_failed: row.items_failed,
            },
            error_detail: row.error_detail,
            diagnostics: row.diagnostics.0,
            worker_host: row.worker_host,
        })
    }
}

/// Postgres-backed job store
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_live(&self, kind: JobKind) -> Result<Option<Uuid>, JobStoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM import_jobs WHERE kind = $1 AND status IN ('queued', 'running') LIMIT 1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[tracing::instrument(skip(self), fields(kind = %kind))]
    async fn create_if_absent(&self, kind: JobKind) -> Result<CreateOutcome, JobStoreError> {
        let record = JobRecord::queued(kind);

        let inserted = sqlx::query(
            r#"
            INSERT INTO import_jobs (id, kind, status, created_at)
            VALUES ($1, $2, 'queued', $3)
            "#,
        )
        .bind(record.id)
        .bind(kind.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!(job_id = %record.id, "Queued job record created");
                Ok(CreateOutcome::Created(record))
            },
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing = self.find_live(kind).await?;
                debug!(existing = ?existing, "Live job already holds kind");
                Ok(CreateOutcome::AlreadyLive(existing))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let filter = filter.clone().normalized();
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM import_jobs
            WHERE ($1::TEXT IS NULL OR kind = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn mark_running(&self, id: Uuid, worker_host: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'running', started_at = NOW(), worker_host = $2
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(worker_host)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_progress(
        &self,
        id: Uuid,
        progress: &JobProgress,
        diagnostics: &[RecordDiagnostic],
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET items_fetched = GREATEST(items_fetched, $2),
                items_upserted = GREATEST(items_upserted, $3),
                items_skipped = GREATEST(items_skipped, $4),
                items_failed = GREATEST(items_failed, $5),
                diagnostics = $6,
                last_progress_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(progress.items_fetched)
        .bind(progress.items_upserted)
        .bind(progress.items_skipped)
        .bind(progress.items_failed)
        .bind(Json(diagnostics))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, outcome), fields(status = %outcome.status))]
    async fn finish(&self, id: Uuid, outcome: &JobOutcome) -> Result<bool, JobStoreError> {
        let progress = outcome.progress.unwrap_or_default();
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = $2,
                error_detail = $3,
                items_fetched = GREATEST(items_fetched, $4),
                items_upserted = GREATEST(items_upserted, $5),
                items_skipped = GREATEST(items_skipped, $6),
                items_failed = GREATEST(items_failed, $7),
                diagnostics = COALESCE($8, diagnostics),
                started_at = COALESCE(started_at, NOW()),
                finished_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.error_detail.as_deref())
        .bind(progress.items_fetched)
        .bind(progress.items_upserted)
        .bind(progress.items_skipped)
        .bind(progress.items_failed)
        .bind(outcome.diagnostics.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn sweep_stale(
        &self,
        cutoff: DateTime<Utc>,
        detail: &str,
    ) -> Result<Vec<Uuid>, JobStoreError> {
        let swept = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE import_jobs
            SET status = 'failed',
                error_detail = $2,
                started_at = COALESCE(started_at, NOW()),
                finished_at = NOW()
            WHERE (status = 'running' AND COALESCE(last_progress_at, started_at, created_at) < $1)
               OR (status = 'queued' AND created_at < $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(detail)
        .fetch_all(&self.pool)
        .await?;

        if swept.is_empty() {
            debug!("No stale jobs found");
        } else {
            for id in &swept {
                warn!(job_id = %id, "Stale job marked failed");
            }
            info!(count = swept.len(), "Stale job sweep completed");
        }

        Ok(swept)
    }
}
