//! In-memory implementations of the ingest seams
//!
//! Used by tests and local experiments. The job store keeps the same
//! check-and-insert atomicity as the Postgres store by holding one lock
//! across the check and the insert.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::exercise::ExerciseRecord;
use super::fetcher::{BlobFetcher, ByteStream, FetchError, SourceReference};
use super::jobs::{
    JobFilter, JobKind, JobOutcome, JobProgress, JobRecord, JobStatus, RecordDiagnostic,
};
use super::library::{Exercise, ExerciseLibrary, LibraryError};
use super::store::{CreateOutcome, JobStore, JobStoreError};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as-is, bypassing the exclusivity check
    pub async fn put(&self, record: JobRecord) {
        self.jobs.lock().await.insert(record.id, record);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_if_absent(&self, kind: JobKind) -> Result<CreateOutcome, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(live) = jobs.values().find(|j| j.kind == kind && j.status.is_live()) {
            return Ok(CreateOutcome::AlreadyLive(Some(live.id)));
        }

        let record = JobRecord::queued(kind);
        jobs.insert(record.id, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let filter = filter.clone().normalized();
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<JobRecord> =
            jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn mark_running(&self, id: Uuid, worker_host: &str) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                job.worker_host = Some(worker_host.to_string());
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        id: Uuid,
        progress: &JobProgress,
        diagnostics: &[RecordDiagnostic],
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.progress = job.progress.max(*progress);
                job.diagnostics = diagnostics.to_vec();
                job.last_progress_at = Some(Utc::now());
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: Uuid, outcome: &JobOutcome) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status.is_live() => {
                let now = Utc::now();
                job.status = outcome.status;
                job.error_detail = outcome.error_detail.clone();
                if let Some(progress) = outcome.progress {
                    job.progress = job.progress.max(progress);
                }
                if let Some(diagnostics) = &outcome.diagnostics {
                    job.diagnostics = diagnostics.clone();
                }
                job.started_at.get_or_insert(now);
                job.finished_at = Some(now);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn sweep_stale(
        &self,
        cutoff: DateTime<Utc>,
        detail: &str,
    ) -> Result<Vec<Uuid>, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut swept = Vec::new();

        for job in jobs.values_mut() {
            if job.status.is_live() && job.last_activity_at() < cutoff {
                job.status = JobStatus::Failed;
                job.error_detail = Some(detail.to_string());
                job.started_at.get_or_insert(now);
                job.finished_at = Some(now);
                swept.push(job.id);
            }
        }

        Ok(swept)
    }
}

/// Exercise library held in a sorted map
pub struct MemoryExerciseLibrary {
    exercises: Mutex<BTreeMap<String, Exercise>>,
    failing_ids: Mutex<HashSet<String>>,
    available: AtomicBool,
}

impl Default for MemoryExerciseLibrary {
    fn default() -> Self {
        Self {
            exercises: Mutex::new(BTreeMap::new()),
            failing_ids: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryExerciseLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage: every call fails while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make writes for one external id fail
    pub async fn fail_writes_for(&self, external_id: &str) {
        self.failing_ids
            .lock()
            .await
            .insert(external_id.to_string());
    }

    pub async fn len(&self) -> usize {
        self.exercises.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exercises.lock().await.is_empty()
    }

    async fn check_write(&self, external_id: &str) -> Result<(), LibraryError> {
        self.check_available()?;
        if self.failing_ids.lock().await.contains(external_id) {
            return Err(LibraryError::Unavailable(format!(
                "write rejected for {external_id}"
            )));
        }
        Ok(())
    }

    fn check_available(&self) -> Result<(), LibraryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LibraryError::Unavailable("library offline".to_string()))
        }
    }
}

#[async_trait]
impl ExerciseLibrary for MemoryExerciseLibrary {
    async fn find(&self, external_id: &str) -> Result<Option<Exercise>, LibraryError> {
        self.check_available()?;
        Ok(self.exercises.lock().await.get(external_id).cloned())
    }

    async fn insert(
        &self,
        record: &ExerciseRecord,
        content_hash: &str,
        job_id: Uuid,
    ) -> Result<(), LibraryError> {
        self.check_write(&record.external_id).await?;
        let mut exercises = self.exercises.lock().await;
        if exercises.contains_key(&record.external_id) {
            return Err(LibraryError::Conflict(record.external_id.clone()));
        }

        let now = Utc::now();
        exercises.insert(
            record.external_id.clone(),
            Exercise {
                external_id: record.external_id.clone(),
                attributes: record.attributes.clone(),
                content_hash: content_hash.to_string(),
                local_annotations: Value::Object(Default::default()),
                source_job_id: Some(job_id),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn update_attributes(
        &self,
        record: &ExerciseRecord,
        content_hash: &str,
        job_id: Uuid,
    ) -> Result<(), LibraryError> {
        self.check_write(&record.external_id).await?;
        let mut exercises = self.exercises.lock().await;
        let existing = exercises
            .get_mut(&record.external_id)
            .ok_or_else(|| LibraryError::NotFound(record.external_id.clone()))?;

        existing.attributes = record.attributes.clone();
        existing.content_hash = content_hash.to_string();
        existing.source_job_id = Some(job_id);
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Exercise>, LibraryError> {
        self.check_available()?;
        Ok(self
            .exercises
            .lock()
            .await
            .values()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn set_annotations(
        &self,
        external_id: &str,
        annotations: Value,
    ) -> Result<Option<Exercise>, LibraryError> {
        self.check_write(external_id).await?;
        let mut exercises = self.exercises.lock().await;
        Ok(exercises.get_mut(external_id).map(|exercise| {
            exercise.local_annotations = annotations;
            exercise.updated_at = Utc::now();
            exercise.clone()
        }))
    }
}

#[derive(Clone)]
enum Scripted {
    Chunks(Vec<Bytes>),
    ChunksThenError(Vec<Bytes>, FetchError),
    Fail(FetchError),
}

/// Fetcher that replays a scripted response for any source
#[derive(Clone)]
pub struct StaticFetcher {
    script: Scripted,
    gate: Option<Arc<Notify>>,
    calls: Arc<AtomicUsize>,
}

impl StaticFetcher {
    fn scripted(script: Scripted) -> Self {
        Self {
            script,
            gate: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serve `body` as a single chunk
    pub fn body(body: impl Into<Bytes>) -> Self {
        Self::scripted(Scripted::Chunks(vec![body.into()]))
    }

    pub fn chunks(chunks: Vec<Bytes>) -> Self {
        Self::scripted(Scripted::Chunks(chunks))
    }

    /// Serve `chunks`, then fail the stream
    pub fn interrupted(chunks: Vec<Bytes>, error: FetchError) -> Self {
        Self::scripted(Scripted::ChunksThenError(chunks, error))
    }

    /// Fail before any byte is produced
    pub fn failing(error: FetchError) -> Self {
        Self::scripted(Scripted::Fail(error))
    }

    /// Hold the stream until the returned handle is notified
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobFetcher for StaticFetcher {
    async fn fetch(&self, _source: &SourceReference) -> Result<ByteStream, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let items: Vec<Result<Bytes, FetchError>> = match &self.script {
            Scripted::Fail(error) => return Err(error.clone()),
            Scripted::Chunks(chunks) => chunks.iter().cloned().map(Ok).collect(),
            Scripted::ChunksThenError(chunks, error) => chunks
                .iter()
                .cloned()
                .map(Ok)
                .chain(std::iter::once(Err(error.clone())))
                .collect(),
        };

        Ok(match self.gate.clone() {
            Some(gate) => stream::once(async move {
                gate.notified().await;
                stream::iter(items)
            })
            .flatten()
            .boxed(),
            None => stream::iter(items).boxed(),
        })
    }
}
