//! Stale-run sweep
//!
//! A job whose runner died (process crash, host lost) would otherwise hold
//! the exclusivity slot for its kind forever. The sweep fails every live
//! record that has shown no activity for longer than the liveness timeout.
//! It runs once at startup and then on a fixed interval.

use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info};
use uuid::Uuid;

use super::store::{JobStore, JobStoreError};

pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct StaleJobSweeper {
    store: Arc<dyn JobStore>,
    liveness_timeout: Duration,
    interval: Duration,
}

impl StaleJobSweeper {
    pub fn new(store: Arc<dyn JobStore>, liveness_timeout: Duration, interval: Duration) -> Self {
        Self {
            store,
            liveness_timeout,
            interval,
        }
    }

    /// Fail every stale live record; returns the ids swept
    pub async fn sweep_once(&self) -> Result<Vec<Uuid>, JobStoreError> {
        let timeout = chrono::Duration::from_std(self.liveness_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let detail = format!(
            "Stale run: no activity for longer than the liveness timeout ({}s), presumed dead",
            self.liveness_timeout.as_secs()
        );

        let swept = self.store.sweep_stale(cutoff, &detail).await?;
        if !swept.is_empty() {
            info!(count = swept.len(), jobs = ?swept, "Stale jobs failed");
        }
        Ok(swept)
    }

    /// Repeat the sweep every interval until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately; the startup sweep covers it
            ticker.tick().await;

            info!(
                interval_secs = self.interval.as_secs(),
                liveness_timeout_secs = self.liveness_timeout.as_secs(),
                "Stale job sweeper started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!(error = %e, "Stale job sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Stale job sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{
        jobs::{JobKind, JobRecord, JobStatus},
        memory::MemoryJobStore,
    };

    fn running_since(minutes_ago: i64) -> JobRecord {
        let mut record = JobRecord::queued(JobKind::UpdateExerciseLibrary);
        record.status = JobStatus::Running;
        record.created_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        record.started_at = Some(record.created_at);
        record
    }

    #[tokio::test]
    async fn test_sweep_fails_only_stale_records() {
        let store = Arc::new(MemoryJobStore::new());
        let stale = running_since(120);
        let fresh = running_since(5);
        store.put(stale.clone()).await;
        store.put(fresh.clone()).await;

        let sweeper =
            StaleJobSweeper::new(store.clone(), Duration::from_secs(3600), DEFAULT_SWEEP_INTERVAL);
        let swept = sweeper.sweep_once().await.unwrap();
        assert_eq!(swept, vec![stale.id]);

        let stale = store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, JobStatus::Failed);
        assert!(stale.finished_at.is_some());
        assert!(stale.error_detail.unwrap().contains("liveness timeout"));

        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_recent_progress_keeps_old_run_alive() {
        let store = Arc::new(MemoryJobStore::new());
        let mut record = running_since(120);
        record.last_progress_at = Some(Utc::now());
        store.put(record.clone()).await;

        let sweeper =
            StaleJobSweeper::new(store.clone(), Duration::from_secs(3600), DEFAULT_SWEEP_INTERVAL);
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_old_queued_record_is_swept() {
        let store = Arc::new(MemoryJobStore::new());
        let mut record = JobRecord::queued(JobKind::UpdateExerciseLibrary);
        record.created_at = Utc::now() - chrono::Duration::hours(3);
        store.put(record.clone()).await;

        let sweeper =
            StaleJobSweeper::new(store.clone(), Duration::from_secs(3600), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(sweeper.sweep_once().await.unwrap(), vec![record.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_on_interval_and_stops() {
        let store = Arc::new(MemoryJobStore::new());
        let sweeper = StaleJobSweeper::new(
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(rx);

        let stale = running_since(120);
        store.put(stale.clone()).await;
        tokio::time::sleep(Duration::from_secs(61)).await;

        let record = store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
