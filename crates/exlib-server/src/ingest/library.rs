//! Exercise library store and the upsert engine that writes to it
//!
//! The engine matches by external id. A missing exercise is inserted, an
//! identical one is left alone, and a differing one has its import-owned
//! columns rewritten. Locally owned data (`local_annotations`) is never
//! part of an import write, and nothing is ever deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::exercise::{ExerciseAttributes, ExerciseRecord};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Exercise already exists: {0}")]
    Conflict(String),

    #[error("Exercise not found: {0}")]
    NotFound(String),

    #[error("Library unavailable: {0}")]
    Unavailable(String),
}

/// Persisted exercise entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exercise {
    pub external_id: String,
    #[serde(flatten)]
    pub attributes: ExerciseAttributes,
    pub content_hash: String,
    /// Owned by the application, never written by an import
    pub local_annotations: Value,
    pub source_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExerciseLibrary: Send + Sync {
    async fn find(&self, external_id: &str) -> Result<Option<Exercise>, LibraryError>;

    /// Fails with [`LibraryError::Conflict`] when the id already exists
    async fn insert(
        &self,
        record: &ExerciseRecord,
        content_hash: &str,
        job_id: Uuid,
    ) -> Result<(), LibraryError>;

    /// Rewrite import-owned columns only
    async fn update_attributes(
        &self,
        record: &ExerciseRecord,
        content_hash: &str,
        job_id: Uuid,
    ) -> Result<(), LibraryError>;

    /// Ordered by external id
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Exercise>, LibraryError>;

    /// Replace the locally owned annotations of an exercise
    async fn set_annotations(
        &self,
        external_id: &str,
        annotations: Value,
    ) -> Result<Option<Exercise>, LibraryError>;
}

/// Per-record result of an upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated { changed: Vec<&'static str> },
    Unchanged,
}

#[derive(Clone)]
pub struct UpsertEngine {
    library: Arc<dyn ExerciseLibrary>,
}

impl UpsertEngine {
    pub fn new(library: Arc<dyn ExerciseLibrary>) -> Self {
        Self { library }
    }

    /// Reconcile one record against the library
    ///
    /// Idempotent: a second call with the same record is `Unchanged`.
    pub async fn upsert(
        &self,
        record: &ExerciseRecord,
        job_id: Uuid,
    ) -> Result<UpsertOutcome, LibraryError> {
        let content_hash = record.attributes.content_hash();

        match self.library.find(&record.external_id).await? {
            Some(existing) => self.update_if_changed(&existing, record, &content_hash, job_id).await,
            None => match self.library.insert(record, &content_hash, job_id).await {
                Ok(()) => Ok(UpsertOutcome::Inserted),
                Err(LibraryError::Conflict(_)) => {
                    // written by someone else between find and insert
                    let existing = self
                        .library
                        .find(&record.external_id)
                        .await?
                        .ok_or_else(|| LibraryError::NotFound(record.external_id.clone()))?;
                    self.update_if_changed(&existing, record, &content_hash, job_id).await
                },
                Err(e) => Err(e),
            },
        }
    }

    async fn update_if_changed(
        &self,
        existing: &Exercise,
        record: &ExerciseRecord,
        content_hash: &str,
        job_id: Uuid,
    ) -> Result<UpsertOutcome, LibraryError> {
        let changed = existing.attributes.changed_fields(&record.attributes);
        if changed.is_empty() {
            return Ok(UpsertOutcome::Unchanged);
        }

        debug!(external_id = %record.external_id, changed = ?changed, "Updating exercise");
        self.library
            .update_attributes(record, content_hash, job_id)
            .await?;
        Ok(UpsertOutcome::Updated { changed })
    }
}

#[derive(Debug, FromRow)]
struct ExerciseRow {
    external_id: String,
    name: String,
    force: Option<String>,
    level: Option<String>,
    mechanic: Option<String>,
    equipment: Option<String>,
    category: Option<String>,
    primary_muscles: Vec<String>,
    secondary_muscles: Vec<String>,
    instructions: Vec<String>,
    images: Vec<String>,
    content_hash: String,
    local_annotations: Value,
    source_job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ExerciseRow> for Exercise {
    fn from(row: ExerciseRow) -> Self {
        Self {
            external_id: row.external_id,
            attributes: ExerciseAttributes {
                name: row.name,
                force: row.force,
                level: row.level,
                mechanic: row.mechanic,
                equipment: row.equipment,
                category: row.category,
                primary_muscles: row.primary_muscles,
                secondary_muscles: row.secondary_muscles,
                instructions: row.instructions,
                images: row.images,
            },
            content_hash: row.content_hash,
            local_annotations: row.local_annotations,
            source_job_id: row.source_job_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const EXERCISE_COLUMNS: &str = "external_id, name, force, level, mechanic, equipment, category, \
     primary_muscles, secondary_muscles, instructions, images, content_hash, \
     local_annotations, source_job_id, created_at, updated_at";

/// Postgres-backed exercise library
#[derive(Clone)]
pub struct PgExerciseLibrary {
    pool: PgPool,
}

impl PgExerciseLibrary {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExerciseLibrary for PgExerciseLibrary {
    async fn find(&self, external_id: &str) -> Result<Option<Exercise>, LibraryError> {
        let row = sqlx::query_as::<_, ExerciseRow>(&format!(
            "SELECT {EXERCISE_COLUMNS} FROM exercises WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Exercise::from))
    }

    async fn insert(
        &self,
        record: &ExerciseRecord,
        content_hash: &str,
        job_id: Uuid,
    ) -> Result<(), LibraryError> {
        let attrs = &record.attributes;
        let result = sqlx::query(
            r#"
            INSERT INTO exercises (
                external_id, name, force, level, mechanic, equipment, category,
                primary_muscles, secondary_muscles, instructions, images,
                content_hash, source_job_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(&record.external_id)
        .bind(&attrs.name)
        .bind(&attrs.force)
        .bind(&attrs.level)
        .bind(&attrs.mechanic)
        .bind(&attrs.equipment)
        .bind(&attrs.category)
        .bind(&attrs.primary_muscles)
        .bind(&attrs.secondary_muscles)
        .bind(&attrs.instructions)
        .bind(&attrs.images)
        .bind(content_hash)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::Conflict(record.external_id.clone()));
        }
        Ok(())
    }

    async fn update_attributes(
        &self,
        record: &ExerciseRecord,
        content_hash: &str,
        job_id: Uuid,
    ) -> Result<(), LibraryError> {
        let attrs = &record.attributes;
        let result = sqlx::query(
            r#"
            UPDATE exercises
            SET name = $2, force = $3, level = $4, mechanic = $5, equipment = $6,
                category = $7, primary_muscles = $8, secondary_muscles = $9,
                instructions = $10, images = $11, content_hash = $12,
                source_job_id = $13, updated_at = NOW()
            WHERE external_id = $1
            "#,
        )
        .bind(&record.external_id)
        .bind(&attrs.name)
        .bind(&attrs.force)
        .bind(&attrs.level)
        .bind(&attrs.mechanic)
        .bind(&attrs.equipment)
        .bind(&attrs.category)
        .bind(&attrs.primary_muscles)
        .bind(&attrs.secondary_muscles)
        .bind(&attrs.instructions)
        .bind(&attrs.images)
        .bind(content_hash)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::NotFound(record.external_id.clone()));
        }
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Exercise>, LibraryError> {
        let rows = sqlx::query_as::<_, ExerciseRow>(&format!(
            "SELECT {EXERCISE_COLUMNS} FROM exercises ORDER BY external_id LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Exercise::from).collect())
    }

    async fn set_annotations(
        &self,
        external_id: &str,
        annotations: Value,
    ) -> Result<Option<Exercise>, LibraryError> {
        let row = sqlx::query_as::<_, ExerciseRow>(&format!(
            r#"
            UPDATE exercises SET local_annotations = $2, updated_at = NOW()
            WHERE external_id = $1
            RETURNING {EXERCISE_COLUMNS}
            "#
        ))
        .bind(external_id)
        .bind(annotations)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Exercise::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::exercise::{Normalizer, RawExercise};
    use crate::ingest::memory::MemoryExerciseLibrary;
    use serde_json::json;

    fn record(id: &str, name: &str, level: &str) -> ExerciseRecord {
        let raw: RawExercise =
            serde_json::from_value(json!({ "id": id, "name": name, "level": level })).unwrap();
        Normalizer::default().normalize(raw).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_insert_then_unchanged() {
        let library = Arc::new(MemoryExerciseLibrary::new());
        let engine = UpsertEngine::new(library.clone());
        let job = Uuid::new_v4();
        let rec = record("Air_Bike", "Air Bike", "beginner");

        assert_eq!(engine.upsert(&rec, job).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(engine.upsert(&rec, job).await.unwrap(), UpsertOutcome::Unchanged);

        let stored = library.find("Air_Bike").await.unwrap().unwrap();
        assert_eq!(stored.content_hash, rec.attributes.content_hash());
        assert_eq!(stored.source_job_id, Some(job));
    }

    #[tokio::test]
    async fn test_upsert_updates_changed_fields_only() {
        let library = Arc::new(MemoryExerciseLibrary::new());
        let engine = UpsertEngine::new(library.clone());

        engine
            .upsert(&record("Air_Bike", "Air Bike", "beginner"), Uuid::new_v4())
            .await
            .unwrap();

        let outcome = engine
            .upsert(&record("Air_Bike", "Air Bike", "expert"), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated { changed: vec!["level"] });

        let stored = library.find("Air_Bike").await.unwrap().unwrap();
        assert_eq!(stored.attributes.level.as_deref(), Some("expert"));
    }

    #[tokio::test]
    async fn test_upsert_preserves_local_annotations() {
        let library = Arc::new(MemoryExerciseLibrary::new());
        let engine = UpsertEngine::new(library.clone());

        engine
            .upsert(&record("Air_Bike", "Air Bike", "beginner"), Uuid::new_v4())
            .await
            .unwrap();
        library
            .set_annotations("Air_Bike", json!({ "note": "knees!" }))
            .await
            .unwrap();

        engine
            .upsert(&record("Air_Bike", "Air Bike Sprint", "beginner"), Uuid::new_v4())
            .await
            .unwrap();

        let stored = library.find("Air_Bike").await.unwrap().unwrap();
        assert_eq!(stored.attributes.name, "Air Bike Sprint");
        assert_eq!(stored.local_annotations, json!({ "note": "knees!" }));
    }

    #[tokio::test]
    async fn test_upsert_propagates_storage_failure() {
        let library = Arc::new(MemoryExerciseLibrary::new());
        library.set_available(false);
        let engine = UpsertEngine::new(library);

        let result = engine
            .upsert(&record("Air_Bike", "Air Bike", "beginner"), Uuid::new_v4())
            .await;
        assert!(matches!(result, Err(LibraryError::Unavailable(_))));
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_pg_upsert_round_trip(pool: PgPool) {
        let job_id: Uuid = sqlx::query_scalar(
            "INSERT INTO import_jobs (id, kind, status) VALUES ($1, 'update_exercise_library', 'running') RETURNING id",
        )
        .bind(Uuid::new_v4())
        .fetch_one(&pool)
        .await
        .unwrap();

        let library = Arc::new(PgExerciseLibrary::new(pool));
        let engine = UpsertEngine::new(library.clone());
        let rec = record("Air_Bike", "Air Bike", "beginner");

        assert_eq!(engine.upsert(&rec, job_id).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(engine.upsert(&rec, job_id).await.unwrap(), UpsertOutcome::Unchanged);

        library
            .set_annotations("Air_Bike", json!({ "favorite": true }))
            .await
            .unwrap()
            .unwrap();
        let outcome = engine
            .upsert(&record("Air_Bike", "Air Bike", "expert"), job_id)
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Updated { .. }));

        let stored = library.find("Air_Bike").await.unwrap().unwrap();
        assert_eq!(stored.local_annotations, json!({ "favorite": true }));
        assert_eq!(library.list(10, 0).await.unwrap().len(), 1);
    }
}
