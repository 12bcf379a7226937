//! Lock recovery sweeper.
//!
//! Workers are stateless and crash-safe: a claim is just a lock timestamp
//! on the job document, and this background task is what releases claims
//! whose holder went away. It also drives physical deletion of jobs that
//! are terminal, billed, and slated for removal.

use std::time::Duration;

use chrono::Utc;

use crate::config::AppConfig;
use crate::result_ext::ResultExt;
use crate::services::lifecycle::{LifecycleService, OutcomePublisher};
use crate::store::JobStore;

/// Periodic maintenance driver over the lifecycle service.
#[derive(Clone)]
pub struct Sweeper<S, P> {
    lifecycle: LifecycleService<S, P>,
    interval: Duration,
    scheduling_timeout: chrono::Duration,
    canceling_timeout: chrono::Duration,
    revert_timeout: chrono::Duration,
}

impl<S: JobStore + Clone, P: OutcomePublisher> Sweeper<S, P> {
    pub fn new(lifecycle: LifecycleService<S, P>, config: &AppConfig) -> Self {
        Self {
            lifecycle,
            interval: Duration::from_secs(config.sweep_interval),
            scheduling_timeout: chrono::Duration::seconds(config.scheduling_lock_timeout as i64),
            canceling_timeout: chrono::Duration::seconds(config.canceling_lock_timeout as i64),
            revert_timeout: chrono::Duration::seconds(config.revert_lock_timeout as i64),
        }
    }

    /// Run the sweep loop until the process shuts down.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One maintenance pass. Each sweep is independent; a failing store
    /// call is logged and retried on the next tick.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        let _ = self
            .lifecycle
            .reset_scheduling_jobs(now - self.scheduling_timeout)
            .await
            .log("Scheduling lock sweep failed");
        let _ = self
            .lifecycle
            .reset_canceling_jobs(now - self.canceling_timeout)
            .await
            .log("Canceling lock sweep failed");
        let _ = self
            .lifecycle
            .reset_revert_scheduling_jobs(now - self.revert_timeout)
            .await
            .log("Revert lock sweep failed");

        match self.lifecycle.deletable_jobs().await {
            Ok(ids) => {
                for id in ids {
                    let _ = self.lifecycle.delete_job(id).await.log("Job deletion failed");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Deletable-job lookup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppResult;
    use crate::model::{Job, JobState};
    use crate::services::lifecycle::{JobOutcome, JobOutcomeEvent};
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct NoopPublisher {
        revoked: Arc<Mutex<Vec<Uuid>>>,
    }

    impl OutcomePublisher for NoopPublisher {
        async fn publish_outcome(&self, _: JobOutcome, _: &JobOutcomeEvent) -> AppResult<()> {
            Ok(())
        }

        async fn publish_acl_revoked(&self, job_id: Uuid) -> AppResult<()> {
            self.revoked.lock().unwrap().push(job_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweep_releases_stale_claim_and_deletes_settled_jobs() {
        let store = MemoryJobStore::new();
        let publisher = NoopPublisher::default();
        let lifecycle = LifecycleService::new(store.clone(), publisher.clone());

        let mut config = AppConfig::default();
        config.scheduling_lock_timeout = 0;
        config.canceling_lock_timeout = 0;
        config.revert_lock_timeout = 0;
        let sweeper = Sweeper::new(lifecycle.clone(), &config);

        // A job claimed by a worker that never came back.
        let job = Job::new(Uuid::new_v4(), "train", "p", "w", json!({}));
        let stuck = job.id;
        lifecycle.submit(&job).await.unwrap();
        lifecycle.mark_ready_for_scheduling(stuck).await.unwrap();
        lifecycle.find_and_lock_for_scheduling().await.unwrap().unwrap();

        // A cancelled job whose project was deleted, ready to disappear.
        let job = Job::new(Uuid::new_v4(), "export", "p", "w", json!({}));
        let done = job.id;
        lifecycle.submit(&job).await.unwrap();
        lifecycle.mark_cancelled_and_deleted(done).await.unwrap();
        lifecycle.set_and_publish_cancelled(done).await.unwrap();

        // Zero-timeout sweep still needs the lock to be strictly in the past.
        tokio::time::sleep(Duration::from_millis(5)).await;
        sweeper.sweep_once().await;

        let job = store.get(stuck).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::ReadyForScheduling);
        assert_eq!(job.executions.main.retry_count, 1);

        assert!(store.get(done).await.unwrap().is_none());
        assert_eq!(publisher.revoked.lock().unwrap().as_slice(), &[done]);
    }
}
