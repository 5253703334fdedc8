//! End-to-end tests for the update exercise library job
//!
//! Everything runs in-process against the in-memory job store and library:
//! deploy through the registry, let the runner finish on its background
//! task, then inspect the job record and the library.

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use exlib_server::ingest::{
    exercise::Normalizer,
    memory::{MemoryExerciseLibrary, MemoryJobStore, StaticFetcher},
    parser::MAX_ELEMENT_BYTES,
    DeployOutcome, ExerciseLibrary, FetchError, JobKind, JobRecord, JobRegistry, JobRunner,
    JobStatus, JobStore, RunnerConfig, StaleJobSweeper, UpsertEngine,
};

const DATASET: &str = r#"[
  {"id": "Air_Bike", "name": "Air Bike", "level": "Beginner", "primaryMuscles": ["abdominals"], "images": ["Air_Bike/0.jpg"]},
  {"id": "Push_Up", "name": "Push Up", "level": "beginner", "primaryMuscles": ["chest"]},
  {"id": "Squat", "name": "Squat", "equipment": "barbell", "primaryMuscles": ["quadriceps"]}
]"#;

struct Harness {
    store: Arc<MemoryJobStore>,
    library: Arc<MemoryExerciseLibrary>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryJobStore::new()),
            library: Arc::new(MemoryExerciseLibrary::new()),
        }
    }

    fn registry(&self, fetcher: StaticFetcher) -> JobRegistry {
        self.registry_with(fetcher, RunnerConfig::default())
    }

    fn registry_with(&self, fetcher: StaticFetcher, config: RunnerConfig) -> JobRegistry {
        let runner = JobRunner::new(
            self.store.clone(),
            Arc::new(fetcher),
            UpsertEngine::new(self.library.clone()),
            "s3://datasets/exercises.json".parse().unwrap(),
            Normalizer::new(Some("https://media.test/exercises".to_string())),
            config,
        );
        JobRegistry::new(self.store.clone()).register(JobKind::UpdateExerciseLibrary, runner)
    }

    async fn run_to_end(&self, registry: &JobRegistry) -> JobRecord {
        let job_id = match registry.deploy(JobKind::UpdateExerciseLibrary).await.unwrap() {
            DeployOutcome::Accepted(id) => id,
            other => panic!("deploy should be accepted, got {other:?}"),
        };
        self.wait_terminal(job_id).await
    }

    async fn wait_terminal(&self, job_id: Uuid) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = self.store.get(job_id).await.unwrap().unwrap();
                if record.status.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach a terminal status")
    }
}

#[tokio::test]
async fn test_import_populates_library() {
    let harness = Harness::new();
    let registry = harness.registry(StaticFetcher::body(DATASET));

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert!(record.error_detail.is_none());
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());
    assert!(record.worker_host.is_some());
    assert_eq!(record.progress.items_fetched, 3);
    assert_eq!(record.progress.items_upserted, 3);
    assert_eq!(record.progress.items_failed, 0);

    let air_bike = harness.library.find("Air_Bike").await.unwrap().unwrap();
    assert_eq!(air_bike.attributes.level.as_deref(), Some("beginner"));
    assert_eq!(
        air_bike.attributes.images,
        vec!["https://media.test/exercises/Air_Bike/0.jpg".to_string()]
    );
    assert_eq!(air_bike.source_job_id, Some(record.id));
}

#[tokio::test]
async fn test_concurrent_deploys_accept_exactly_one() {
    let harness = Harness::new();
    let (fetcher, gate) = StaticFetcher::body(DATASET).gated();
    let registry = Arc::new(harness.registry(fetcher));

    let outcomes = join_all((0..10).map(|_| {
        let registry = registry.clone();
        async move { registry.deploy(JobKind::UpdateExerciseLibrary).await.unwrap() }
    }))
    .await;

    let accepted: Vec<Uuid> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            DeployOutcome::Accepted(id) => Some(*id),
            DeployOutcome::RejectedAlreadyRunning(_) => None,
        })
        .collect();
    assert_eq!(accepted.len(), 1);

    for outcome in &outcomes {
        if let DeployOutcome::RejectedAlreadyRunning(existing) = outcome {
            assert_eq!(*existing, Some(accepted[0]));
        }
    }

    gate.notify_one();
    let record = harness.wait_terminal(accepted[0]).await;
    assert_eq!(record.status, JobStatus::Succeeded);

    let all = harness.store.list(&Default::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let harness = Harness::new();
    let registry = harness.registry(StaticFetcher::body(DATASET));

    let first = harness.run_to_end(&registry).await;
    let before = harness.library.find("Push_Up").await.unwrap().unwrap();

    let second = harness.run_to_end(&registry).await;
    let after = harness.library.find("Push_Up").await.unwrap().unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(second.status, JobStatus::Succeeded);
    assert_eq!(second.progress.items_upserted, 0);
    assert_eq!(second.progress.items_skipped, 3);
    assert_eq!(harness.library.len().await, 3);
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_malformed_record_is_isolated() {
    let harness = Harness::new();
    let dataset = r#"[
        {"id": "Air_Bike", "name": "Air Bike"},
        {"id": "Broken", "level": "beginner"},
        {"id": "Push_Up", "name": "Push Up"},
        {"id": "Squat", "name": "Squat"}
    ]"#;
    let registry = harness.registry(StaticFetcher::body(dataset));

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.progress.items_fetched, 4);
    assert_eq!(record.progress.items_upserted, 3);
    assert_eq!(record.progress.items_failed, 1);
    assert_eq!(record.diagnostics.len(), 1);
    assert_eq!(record.diagnostics[0].index, 1);
    assert_eq!(record.diagnostics[0].external_id.as_deref(), Some("Broken"));
    assert!(harness.library.find("Broken").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unbalanced_record_is_isolated() {
    let harness = Harness::new();
    let dataset = r#"[
        {"id": "Air_Bike", "name": "Air Bike"},
        {"id": "Broken", "name": "Broken"}},
        {"id": "Squat", "name": "Squat"}
    ]"#;
    let registry = harness.registry(StaticFetcher::body(dataset));

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.progress.items_upserted, 2);
    assert_eq!(record.progress.items_failed, 1);
    assert_eq!(record.diagnostics[0].external_id.as_deref(), Some("Broken"));
    assert!(harness.library.find("Broken").await.unwrap().is_none());
    assert!(harness.library.find("Squat").await.unwrap().is_some());
}

#[tokio::test]
async fn test_oversized_record_is_isolated() {
    let harness = Harness::new();
    let huge = json!({
        "id": "Huge",
        "name": "Huge",
        "instructions": ["x".repeat(MAX_ELEMENT_BYTES + 10)],
    });
    let dataset = json!([
        { "id": "Air_Bike", "name": "Air Bike" },
        huge,
        { "id": "Squat", "name": "Squat" },
    ]);
    let body = serde_json::to_vec(&dataset).unwrap();
    let chunks = body.chunks(256 * 1024).map(Bytes::copy_from_slice).collect();
    let registry = harness.registry(StaticFetcher::chunks(chunks));

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.progress.items_fetched, 3);
    assert_eq!(record.progress.items_upserted, 2);
    assert_eq!(record.progress.items_failed, 1);
    assert_eq!(record.diagnostics[0].index, 1);
    assert!(record.diagnostics[0].message.contains("exceeds"));
    assert!(harness.library.find("Huge").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unparsable_dataset_fails_without_writes() {
    let harness = Harness::new();
    let registry = harness.registry(StaticFetcher::body("<html>rate limited</html>"));

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_detail.unwrap().starts_with("Dataset unreadable"));
    assert_eq!(record.progress.items_upserted, 0);
    assert!(harness.library.is_empty().await);
}

#[tokio::test]
async fn test_empty_dataset_succeeds() {
    let harness = Harness::new();
    let registry = harness.registry(StaticFetcher::body("[]"));

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.progress.items_fetched, 0);
}

#[tokio::test]
async fn test_missing_source_fails() {
    let harness = Harness::new();
    let fetcher = StaticFetcher::failing(FetchError::NotFound("datasets/exercises.json".into()));
    let registry = harness.registry(fetcher.clone());

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_detail.unwrap().contains("Source not found"));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_interrupted_stream_keeps_partial_progress() {
    let harness = Harness::new();
    let fetcher = StaticFetcher::interrupted(
        vec![Bytes::from_static(
            br#"[{"id": "Air_Bike", "name": "Air Bike"}, {"id": "Push_"#,
        )],
        FetchError::Transport("connection reset".into()),
    );
    let registry = harness.registry(fetcher);

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_detail.unwrap().contains("connection reset"));
    assert_eq!(record.progress.items_upserted, 1);
    assert!(harness.library.find("Air_Bike").await.unwrap().is_some());
}

#[tokio::test]
async fn test_storage_outage_aborts_run() {
    let harness = Harness::new();
    let dataset: Vec<_> = (0..20)
        .map(|i| json!({ "id": format!("Exercise_{i}"), "name": format!("Exercise {i}") }))
        .collect();
    let registry = harness.registry(StaticFetcher::body(serde_json::to_vec(&dataset).unwrap()));
    harness.library.set_available(false);

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_detail.unwrap().contains("5 consecutive write failures"));
    assert_eq!(record.progress.items_failed, 5);
}

#[tokio::test]
async fn test_single_write_failure_does_not_fail_job() {
    let harness = Harness::new();
    harness.library.fail_writes_for("Push_Up").await;
    let registry = harness.registry(StaticFetcher::body(DATASET));

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.progress.items_upserted, 2);
    assert_eq!(record.progress.items_failed, 1);
    assert_eq!(record.diagnostics[0].external_id.as_deref(), Some("Push_Up"));
}

#[tokio::test]
async fn test_failure_ratio_policy() {
    let harness = Harness::new();
    let dataset = r#"[{"id": "A", "name": "A"}, {"id": "B"}, {"id": "C"}]"#;
    let registry = harness.registry_with(
        StaticFetcher::body(dataset),
        RunnerConfig {
            max_failure_ratio: Some(0.5),
            ..Default::default()
        },
    );

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_detail.unwrap().contains("2 of 3 records failed"));
    // accepted records stay written
    assert!(harness.library.find("A").await.unwrap().is_some());
}

#[tokio::test]
async fn test_stale_run_is_swept_and_kind_redeployable() {
    let harness = Harness::new();
    let mut stale = JobRecord::queued(JobKind::UpdateExerciseLibrary);
    stale.status = JobStatus::Running;
    stale.created_at = Utc::now() - chrono::Duration::days(2);
    stale.started_at = Some(stale.created_at);
    harness.store.put(stale.clone()).await;

    let registry = harness.registry(StaticFetcher::body(DATASET));
    assert_eq!(
        registry.deploy(JobKind::UpdateExerciseLibrary).await.unwrap(),
        DeployOutcome::RejectedAlreadyRunning(Some(stale.id))
    );

    let sweeper = StaleJobSweeper::new(
        harness.store.clone(),
        Duration::from_secs(24 * 60 * 60),
        Duration::from_secs(300),
    );
    assert_eq!(sweeper.sweep_once().await.unwrap(), vec![stale.id]);

    let swept = harness.store.get(stale.id).await.unwrap().unwrap();
    assert_eq!(swept.status, JobStatus::Failed);
    assert!(swept.finished_at.is_some());

    let record = harness.run_to_end(&registry).await;
    assert_eq!(record.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_swept_run_keeps_failure_after_runner_resumes() {
    let harness = Harness::new();
    let (fetcher, gate) = StaticFetcher::body(DATASET).gated();
    let registry = harness.registry(fetcher);

    let job_id = match registry.deploy(JobKind::UpdateExerciseLibrary).await.unwrap() {
        DeployOutcome::Accepted(id) => id,
        other => panic!("deploy should be accepted, got {other:?}"),
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while harness.store.get(job_id).await.unwrap().unwrap().status != JobStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never started");
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = StaleJobSweeper::new(harness.store.clone(), Duration::ZERO, Duration::from_secs(300));
    assert_eq!(sweeper.sweep_once().await.unwrap(), vec![job_id]);

    gate.notify_one();
    tokio::time::timeout(Duration::from_secs(10), async {
        while registry.active_runs() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("runner did not exit");

    let record = harness.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_detail.unwrap().contains("liveness timeout"));

    assert!(matches!(
        registry.deploy(JobKind::UpdateExerciseLibrary).await.unwrap(),
        DeployOutcome::Accepted(_)
    ));
}

#[tokio::test]
async fn test_local_annotations_survive_update() {
    let harness = Harness::new();
    harness.run_to_end(&harness.registry(StaticFetcher::body(DATASET))).await;

    harness
        .library
        .set_annotations("Push_Up", json!({ "favourite": true }))
        .await
        .unwrap()
        .unwrap();

    let updated = DATASET.replace(r#""name": "Push Up""#, r#""name": "Push-Up""#);
    let record = harness
        .run_to_end(&harness.registry(StaticFetcher::body(updated)))
        .await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.progress.items_upserted, 1);
    assert_eq!(record.progress.items_skipped, 2);

    let push_up = harness.library.find("Push_Up").await.unwrap().unwrap();
    assert_eq!(push_up.attributes.name, "Push-Up");
    assert_eq!(push_up.local_annotations, json!({ "favourite": true }));
    assert_eq!(push_up.source_job_id, Some(record.id));
}

#[tokio::test]
async fn test_progress_is_flushed_during_run() {
    let harness = Harness::new();
    let dataset: Vec<_> = (0..25)
        .map(|i| json!({ "id": format!("Exercise_{i:02}"), "name": format!("Exercise {i}") }))
        .collect();
    let body = serde_json::to_vec(&dataset).unwrap();
    let chunks = body.chunks(64).map(Bytes::copy_from_slice).collect();
    let registry = harness.registry_with(
        StaticFetcher::chunks(chunks),
        RunnerConfig {
            progress_flush_every: 10,
            ..Default::default()
        },
    );

    let record = harness.run_to_end(&registry).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.progress.items_upserted, 25);
    assert!(record.last_progress_at.is_some());
    assert_eq!(harness.library.len().await, 25);
}
