//! The job lifecycle state machine.
//!
//! Every operation here is an atomic conditional update against the job
//! store: the expected-state filter and the mutations travel together, so a
//! job that already moved on is simply not matched and the caller sees
//! `false` (or `None`). Multiple worker processes can therefore run the
//! same operations concurrently without coordination.
//!
//! Terminal transitions publish their outcome event only when the
//! underlying write applied, which keeps downstream consumers at
//! exactly-once even when two workers race on the same job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::{
    ConsumedResource, ExecutionKind, GpuState, Job, JobState, StateGroup, StepDetail,
};
use crate::result_ext::ResultExt;
use crate::store::{JobFilter, JobMutation, JobStore, StepPatch};

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished,
    Failed,
    Cancelled,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Finished => "FINISHED",
            JobOutcome::Failed => "FAILED",
            JobOutcome::Cancelled => "CANCELLED",
        }
    }
}

/// Body of a published job-outcome event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcomeEvent {
    pub job_id: Uuid,
    pub workspace_id: String,
    pub job_type: String,
    pub job_payload: serde_json::Value,
    pub job_metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_time: Option<DateTime<Utc>>,
}

impl JobOutcomeEvent {
    fn from_job(job: &Job, outcome: JobOutcome) -> Self {
        Self {
            job_id: job.id,
            workspace_id: job.workspace_id.clone(),
            job_type: job.job_type.clone(),
            job_payload: job.payload.clone(),
            job_metadata: job.metadata.clone(),
            start_time: job.start_time,
            end_time: job.end_time,
            cancel_time: match outcome {
                JobOutcome::Cancelled => job.cancellation_info.cancel_time,
                _ => None,
            },
        }
    }
}

/// Side effects emitted by terminal transitions and deletions.
pub trait OutcomePublisher: Send + Sync {
    /// Publish a job-outcome event.
    fn publish_outcome(
        &self,
        outcome: JobOutcome,
        event: &JobOutcomeEvent,
    ) -> impl std::future::Future<Output = AppResult<()>> + Send;

    /// Tell the access-control subsystem to drop job-scoped permissions.
    fn publish_acl_revoked(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = AppResult<()>> + Send;
}

/// The state machine service. Cheap to clone; one instance per process,
/// shared by the consumer loop and the sweeper.
#[derive(Clone)]
pub struct LifecycleService<S, P> {
    store: S,
    publisher: P,
}

impl<S: JobStore + Clone, P: OutcomePublisher> LifecycleService<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Insert a freshly submitted job.
    pub async fn submit(&self, job: &Job) -> AppResult<()> {
        self.store.insert(job).await?;
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "Job submitted");
        Ok(())
    }

    /// Admission hook: the job's resources have been granted, release it
    /// to the scheduler pool.
    pub async fn mark_ready_for_scheduling(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_state(JobState::Submitted),
                &[JobMutation::SetState(JobState::ReadyForScheduling)],
            )
            .await
    }

    /// Cooperative cancellation entry: flags the job; the cancel worker
    /// picks it up through [`Self::find_and_lock_for_canceling`].
    pub async fn request_cancellation(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_states(JobState::ACTIVE).cancelled(false),
                &[JobMutation::SetCancelled {
                    request_time: Utc::now(),
                }],
            )
            .await
    }

    /// Claim exactly one schedulable job; `None` when nothing is waiting.
    pub async fn find_and_lock_for_scheduling(&self) -> AppResult<Option<Job>> {
        self.store
            .find_one_and_update(
                &JobFilter::new()
                    .in_state(JobState::ReadyForScheduling)
                    .cancelled(false),
                &[
                    JobMutation::SetState(JobState::SchedulingLocked),
                    JobMutation::Lock(ExecutionKind::Main, Utc::now()),
                ],
            )
            .await
    }

    /// The claimed job has been dispatched to the engine: record the
    /// execution, materialize the step plan, release the lock.
    pub async fn set_scheduled(
        &self,
        job_id: Uuid,
        execution_id: &str,
        launch_plan_id: Option<&str>,
        step_details: Vec<StepDetail>,
    ) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_state(JobState::SchedulingLocked),
                &[
                    JobMutation::SetState(JobState::Scheduled),
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::SetMainExecution {
                        execution_id: execution_id.to_string(),
                        launch_plan_id: launch_plan_id.map(str::to_string),
                    },
                    JobMutation::SetStepDetails(step_details),
                ],
            )
            .await
    }

    pub async fn set_running(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_state(JobState::Scheduled),
                &[
                    JobMutation::SetState(JobState::Running),
                    JobMutation::SetStartTime(Utc::now()),
                ],
            )
            .await
    }

    /// Partial update of one step, matched by task id.
    pub async fn set_step_details(
        &self,
        job_id: Uuid,
        task_id: &str,
        patch: &StepPatch,
    ) -> AppResult<bool> {
        self.store.update_step(job_id, task_id, patch).await
    }

    /// Claim one cancellation-flagged job for the cancel worker.
    pub async fn find_and_lock_for_canceling(&self) -> AppResult<Option<Job>> {
        self.store
            .find_one_and_update(
                &JobFilter::new()
                    .in_states(&[JobState::Scheduled, JobState::Running])
                    .cancelled(true),
                &[
                    JobMutation::SetState(JobState::CancelingLocked),
                    JobMutation::Lock(ExecutionKind::Main, Utc::now()),
                ],
            )
            .await
    }

    /// A cancel attempt timed out or failed: release the job back to its
    /// pre-lock state for another attempt.
    pub async fn reset_canceling_job(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_state(JobState::CancelingLocked),
                &[
                    JobMutation::RestoreUnlockedState,
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::BumpCancelRetry,
                ],
            )
            .await
    }

    /// Administrative unwind of a cancellation request. Needs a read first:
    /// only a canceling-locked job gets its state restored, a merely
    /// flagged job keeps whatever state it is in.
    pub async fn drop_cancelled_flag(&self, job_id: Uuid) -> AppResult<bool> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(false);
        };

        if job.state == JobState::CancelingLocked {
            self.store
                .update_if(
                    job_id,
                    &JobFilter::new().in_state(JobState::CancelingLocked),
                    &[
                        JobMutation::ClearCancelled,
                        JobMutation::RestoreUnlockedState,
                        JobMutation::ClearLock(ExecutionKind::Main),
                    ],
                )
                .await
        } else {
            self.store
                .update_if(
                    job_id,
                    &JobFilter::new().cancelled(true),
                    &[JobMutation::ClearCancelled],
                )
                .await
        }
    }

    /// The main execution failed or was aborted: route the job into the
    /// revert sub-pipeline.
    pub async fn set_ready_for_revert(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_states(JobState::MAIN_ACTIVE),
                &[
                    JobMutation::SetState(JobState::ReadyForRevert),
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::ResetRevertExecution,
                ],
            )
            .await
    }

    pub async fn find_and_lock_for_reverting(&self) -> AppResult<Option<Job>> {
        self.store
            .find_one_and_update(
                &JobFilter::new().in_state(JobState::ReadyForRevert),
                &[
                    JobMutation::SetState(JobState::RevertSchedulingLocked),
                    JobMutation::Lock(ExecutionKind::Revert, Utc::now()),
                ],
            )
            .await
    }

    pub async fn set_revert_scheduled(&self, job_id: Uuid, execution_id: &str) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_state(JobState::RevertSchedulingLocked),
                &[
                    JobMutation::SetState(JobState::RevertScheduled),
                    JobMutation::ClearLock(ExecutionKind::Revert),
                    JobMutation::SetRevertExecution {
                        execution_id: execution_id.to_string(),
                    },
                ],
            )
            .await
    }

    pub async fn set_revert_running(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().in_state(JobState::RevertScheduled),
                &[JobMutation::SetState(JobState::RevertRunning)],
            )
            .await
    }

    /// Terminal success. A job that already entered the revert pipeline
    /// cannot be finished by a late main-workflow event, hence the
    /// main-pipeline state filter. Publishes only when the write applied.
    pub async fn set_and_publish_finished(&self, job_id: Uuid) -> AppResult<bool> {
        let updated = self
            .store
            .find_one_and_update(
                &JobFilter::new()
                    .with_id(job_id)
                    .in_states(JobState::MAIN_ACTIVE),
                &[
                    JobMutation::SetState(JobState::Finished),
                    JobMutation::SetEndTime(Utc::now()),
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::ClearLock(ExecutionKind::Revert),
                    JobMutation::SetGpuState(GpuState::Released),
                ],
            )
            .await?;

        match updated {
            Some(job) => {
                self.publish(JobOutcome::Finished, &job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Terminal failure. Steps are left as they are; a failed plan is
    /// diagnostic information.
    pub async fn set_and_publish_failed(&self, job_id: Uuid) -> AppResult<bool> {
        let updated = self
            .store
            .find_one_and_update(
                &JobFilter::new().with_id(job_id).in_states(JobState::ACTIVE),
                &[
                    JobMutation::SetState(JobState::Failed),
                    JobMutation::SetEndTime(Utc::now()),
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::ClearLock(ExecutionKind::Revert),
                ],
            )
            .await?;

        match updated {
            Some(job) => {
                self.publish(JobOutcome::Failed, &job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Terminal cancellation: also freezes the plan by bulk-moving every
    /// step still waiting or running to cancelled.
    pub async fn set_and_publish_cancelled(&self, job_id: Uuid) -> AppResult<bool> {
        let now = Utc::now();
        let updated = self
            .store
            .find_one_and_update(
                &JobFilter::new().with_id(job_id).in_states(JobState::ACTIVE),
                &[
                    JobMutation::SetState(JobState::Cancelled),
                    JobMutation::SetEndTime(now),
                    JobMutation::SetCancelTime(now),
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::ClearLock(ExecutionKind::Revert),
                ],
            )
            .await?;

        match updated {
            Some(job) => {
                self.store
                    .update_steps_in_states(
                        job_id,
                        &[
                            crate::model::StepState::Waiting,
                            crate::model::StepState::Running,
                        ],
                        crate::model::StepState::Cancelled,
                    )
                    .await?;
                self.publish(JobOutcome::Cancelled, &job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn publish(&self, outcome: JobOutcome, job: &Job) -> AppResult<()> {
        let event = JobOutcomeEvent::from_job(job, outcome);
        self.publisher.publish_outcome(outcome, &event).await?;
        tracing::info!(job_id = %job.id, outcome = outcome.as_str(), "Job reached terminal state");
        Ok(())
    }

    /// Flag one job as cancelled and slated for physical deletion.
    pub async fn mark_cancelled_and_deleted(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new(),
                &[
                    JobMutation::SetCancelled {
                        request_time: Utc::now(),
                    },
                    JobMutation::SetDeleteJob,
                ],
            )
            .await
    }

    /// Flag every job of a deleted project as cancelled and deletable.
    pub async fn mark_project_jobs_deleted(&self, project_id: &str) -> AppResult<u64> {
        let count = self
            .store
            .update_many_if(
                &JobFilter::new().in_project(project_id),
                &[
                    JobMutation::SetCancelled {
                        request_time: Utc::now(),
                    },
                    JobMutation::SetDeleteJob,
                ],
            )
            .await?;
        tracing::info!(project_id = %project_id, count, "Project jobs marked for deletion");
        Ok(count)
    }

    /// Hard delete; on success the access-control subsystem is told to
    /// drop job-scoped permissions. A failed notification does not undo
    /// the delete; ACL cleanup is idempotent downstream.
    pub async fn delete_job(&self, job_id: Uuid) -> AppResult<bool> {
        let deleted = self.store.delete(job_id).await?;
        if deleted {
            let _ = self
                .publisher
                .publish_acl_revoked(job_id)
                .await
                .log("ACL revoke publish failed");
            tracing::info!(job_id = %job_id, "Job deleted");
        }
        Ok(deleted)
    }

    /// Non-destructive key union into the job's metadata.
    pub async fn update_metadata(
        &self,
        job_id: Uuid,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> AppResult<bool> {
        self.store
            .update_if(job_id, &JobFilter::new(), &[JobMutation::MergeMetadata(patch)])
            .await
    }

    /// Append consumption records; records for units the job never
    /// requested are dropped by the store mutation.
    pub async fn update_cost_consumed(
        &self,
        job_id: Uuid,
        records: Vec<ConsumedResource>,
    ) -> AppResult<bool> {
        self.store
            .update_if(job_id, &JobFilter::new(), &[JobMutation::AppendConsumed(records)])
            .await
    }

    /// Flip the at-most-once billing flag; `false` when it was already set.
    pub async fn set_cost_reported(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().cost_settled(false),
                &[JobMutation::SetCostReported],
            )
            .await
    }

    pub async fn set_gpu_released(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new(),
                &[JobMutation::SetGpuState(GpuState::Released)],
            )
            .await
    }

    /// Release scheduling claims whose holder went away.
    pub async fn reset_scheduling_jobs(&self, threshold: DateTime<Utc>) -> AppResult<u64> {
        let count = self
            .store
            .update_many_if(
                &JobFilter::new()
                    .in_state(JobState::SchedulingLocked)
                    .main_locked_before(threshold),
                &[
                    JobMutation::SetState(JobState::ReadyForScheduling),
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::BumpRetry(ExecutionKind::Main),
                ],
            )
            .await?;
        if count > 0 {
            tracing::warn!(count, "Released stale scheduling locks");
        }
        Ok(count)
    }

    /// Release cancel claims whose holder went away; the job returns to
    /// the non-locked state of its preserved group.
    pub async fn reset_canceling_jobs(&self, threshold: DateTime<Utc>) -> AppResult<u64> {
        let count = self
            .store
            .update_many_if(
                &JobFilter::new()
                    .in_state(JobState::CancelingLocked)
                    .main_locked_before(threshold),
                &[
                    JobMutation::RestoreUnlockedState,
                    JobMutation::ClearLock(ExecutionKind::Main),
                    JobMutation::BumpCancelRetry,
                ],
            )
            .await?;
        if count > 0 {
            tracing::warn!(count, "Released stale canceling locks");
        }
        Ok(count)
    }

    /// Release revert-scheduling claims whose holder went away.
    pub async fn reset_revert_scheduling_jobs(&self, threshold: DateTime<Utc>) -> AppResult<u64> {
        let count = self
            .store
            .update_many_if(
                &JobFilter::new()
                    .in_state(JobState::RevertSchedulingLocked)
                    .revert_locked_before(threshold),
                &[
                    JobMutation::SetState(JobState::ReadyForRevert),
                    JobMutation::ClearLock(ExecutionKind::Revert),
                    JobMutation::BumpRetry(ExecutionKind::Revert),
                ],
            )
            .await?;
        if count > 0 {
            tracing::warn!(count, "Released stale revert scheduling locks");
        }
        Ok(count)
    }

    /// Jobs eligible for physical deletion: terminal, slated for deletion,
    /// and nothing left to bill.
    pub async fn deletable_jobs(&self) -> AppResult<Vec<Uuid>> {
        self.store
            .find_ids(
                &JobFilter::new()
                    .in_groups(StateGroup::TERMINAL)
                    .slated_for_deletion(true)
                    .cost_settled(true),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobCost, ResourceRequest, StepState};
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        outcomes: Arc<Mutex<Vec<(JobOutcome, JobOutcomeEvent)>>>,
        revoked: Arc<Mutex<Vec<Uuid>>>,
    }

    impl RecordingPublisher {
        fn outcomes(&self) -> Vec<(JobOutcome, JobOutcomeEvent)> {
            self.outcomes.lock().unwrap().clone()
        }
    }

    impl OutcomePublisher for RecordingPublisher {
        async fn publish_outcome(
            &self,
            outcome: JobOutcome,
            event: &JobOutcomeEvent,
        ) -> AppResult<()> {
            self.outcomes.lock().unwrap().push((outcome, event.clone()));
            Ok(())
        }

        async fn publish_acl_revoked(&self, job_id: Uuid) -> AppResult<()> {
            self.revoked.lock().unwrap().push(job_id);
            Ok(())
        }
    }

    fn service() -> (
        LifecycleService<MemoryJobStore, RecordingPublisher>,
        RecordingPublisher,
    ) {
        let publisher = RecordingPublisher::default();
        (
            LifecycleService::new(MemoryJobStore::new(), publisher.clone()),
            publisher,
        )
    }

    async fn submitted_job(
        service: &LifecycleService<MemoryJobStore, RecordingPublisher>,
    ) -> Uuid {
        let job = Job::new(Uuid::new_v4(), "train", "project-1", "workspace-1", json!({}));
        let id = job.id;
        service.submit(&job).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_happy_path_to_finished() {
        let (service, publisher) = service();
        let id = submitted_job(&service).await;

        assert!(service.mark_ready_for_scheduling(id).await.unwrap());

        let claimed = service.find_and_lock_for_scheduling().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, JobState::SchedulingLocked);
        assert!(claimed.executions.main.process_start_time.is_some());

        let steps = vec![StepDetail::waiting("t1", "Train")];
        assert!(service
            .set_scheduled(id, "exec-1", Some("lp-1"), steps)
            .await
            .unwrap());
        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert!(job.executions.main.process_start_time.is_none());
        assert_eq!(job.executions.main.execution_id.as_deref(), Some("exec-1"));

        assert!(service.set_running(id).await.unwrap());
        assert!(service.set_and_publish_finished(id).await.unwrap());

        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.state_group, StateGroup::Finished);
        assert!(job.end_time.is_some());

        let outcomes = publisher.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, JobOutcome::Finished);
        assert!(outcomes[0].1.end_time.is_some());
    }

    #[tokio::test]
    async fn test_terminal_transitions_publish_once() {
        let (service, publisher) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        service.set_scheduled(id, "exec-1", None, vec![]).await.unwrap();
        service.set_running(id).await.unwrap();

        assert!(service.set_and_publish_finished(id).await.unwrap());
        // Lost race: second terminal write does not apply, no second event.
        assert!(!service.set_and_publish_finished(id).await.unwrap());
        assert!(!service.set_and_publish_failed(id).await.unwrap());
        assert_eq!(publisher.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_finished_rejected_once_reverting() {
        let (service, publisher) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        service.set_scheduled(id, "exec-1", None, vec![]).await.unwrap();
        service.set_running(id).await.unwrap();
        service.set_ready_for_revert(id).await.unwrap();

        // Late SUCCEEDED event for the main workflow.
        assert!(!service.set_and_publish_finished(id).await.unwrap());
        assert!(publisher.outcomes().is_empty());

        // The revert pipeline still concludes the job.
        assert!(service.set_and_publish_failed(id).await.unwrap());
        assert_eq!(publisher.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_revert_cancelled_scenario() {
        let (service, publisher) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        let steps = vec![
            StepDetail::waiting("t1", "Prepare"),
            StepDetail::waiting("t2", "Train"),
        ];
        service.set_scheduled(id, "exec-1", None, steps).await.unwrap();
        service.set_running(id).await.unwrap();
        service
            .set_step_details(
                id,
                "t1",
                &StepPatch {
                    state: Some(StepState::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(service.request_cancellation(id).await.unwrap());

        let claimed = service.find_and_lock_for_canceling().await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::CancelingLocked);
        // The prior group survives the canceling lock.
        assert_eq!(claimed.state_group, StateGroup::Running);

        // The stop command lands: the main workflow reports failure and the
        // revert pipeline runs to completion.
        assert!(service.set_ready_for_revert(id).await.unwrap());
        let reverting = service.find_and_lock_for_reverting().await.unwrap().unwrap();
        assert_eq!(reverting.id, id);
        assert!(service.set_revert_scheduled(id, "exec-2").await.unwrap());
        assert!(service.set_revert_running(id).await.unwrap());
        assert!(service.set_and_publish_cancelled(id).await.unwrap());

        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.cancellation_info.cancel_time.is_some());
        for step in &job.step_details {
            assert_eq!(step.state, StepState::Cancelled);
        }

        let outcomes = publisher.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, JobOutcome::Cancelled);
        assert!(outcomes[0].1.cancel_time.is_some());
    }

    #[tokio::test]
    async fn test_reset_canceling_restores_prior_group_state() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        service.set_scheduled(id, "exec-1", None, vec![]).await.unwrap();
        service.set_running(id).await.unwrap();
        service.request_cancellation(id).await.unwrap();
        service.find_and_lock_for_canceling().await.unwrap().unwrap();

        assert!(service.reset_canceling_job(id).await.unwrap());
        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.executions.main.process_start_time.is_none());
        assert_eq!(job.cancellation_info.cancel_retry_count, 1);
        // Still flagged: the cancel worker will claim it again.
        assert!(job.cancellation_info.is_cancelled);
    }

    #[tokio::test]
    async fn test_drop_cancelled_flag_unwinds_lock() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        service.set_scheduled(id, "exec-1", None, vec![]).await.unwrap();
        service.request_cancellation(id).await.unwrap();
        service.find_and_lock_for_canceling().await.unwrap().unwrap();

        assert!(service.drop_cancelled_flag(id).await.unwrap());
        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert!(!job.cancellation_info.is_cancelled);
        assert_eq!(job.cancellation_info.cancel_retry_count, 0);
    }

    #[tokio::test]
    async fn test_scheduling_sweep_threshold() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();

        // The lock is fresh: nothing to release.
        let threshold = Utc::now() - chrono::Duration::seconds(300);
        assert_eq!(service.reset_scheduling_jobs(threshold).await.unwrap(), 0);

        // Past the threshold the claim is released and the retry counted.
        let threshold = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(service.reset_scheduling_jobs(threshold).await.unwrap(), 1);
        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::ReadyForScheduling);
        assert!(job.executions.main.process_start_time.is_none());
        assert_eq!(job.executions.main.retry_count, 1);
    }

    #[tokio::test]
    async fn test_revert_sweep_releases_stale_claim() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        service.set_scheduled(id, "exec-1", None, vec![]).await.unwrap();
        service.set_running(id).await.unwrap();
        service.set_ready_for_revert(id).await.unwrap();
        service.find_and_lock_for_reverting().await.unwrap().unwrap();

        let threshold = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(
            service.reset_revert_scheduling_jobs(threshold).await.unwrap(),
            1
        );
        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::ReadyForRevert);
        assert_eq!(job.executions.revert.retry_count, 1);
    }

    #[tokio::test]
    async fn test_canceling_sweep_restores_preserved_group_state() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        service.set_scheduled(id, "exec-1", None, vec![]).await.unwrap();
        service.set_running(id).await.unwrap();
        service.request_cancellation(id).await.unwrap();
        service.find_and_lock_for_canceling().await.unwrap().unwrap();

        // The lock is fresh: nothing to release.
        let threshold = Utc::now() - chrono::Duration::seconds(300);
        assert_eq!(service.reset_canceling_jobs(threshold).await.unwrap(), 0);

        // Past the threshold the job goes back to its group's non-locked
        // state, here Running, still flagged for cancellation.
        let threshold = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(service.reset_canceling_jobs(threshold).await.unwrap(), 1);
        let job = service.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.executions.main.process_start_time.is_none());
        assert!(job.cancellation_info.is_cancelled);
        assert_eq!(job.cancellation_info.cancel_retry_count, 1);
    }

    #[tokio::test]
    async fn test_cost_reported_flips_once() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        {
            let mut job = service.store().get(id).await.unwrap().unwrap();
            job.cost = Some(JobCost {
                requests: vec![ResourceRequest {
                    amount: 100,
                    unit: "images".to_string(),
                }],
                ..Default::default()
            });
            service.store().delete(id).await.unwrap();
            service.store().insert(&job).await.unwrap();
        }

        assert!(service.set_cost_reported(id).await.unwrap());
        assert!(!service.set_cost_reported(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_deletable_jobs_require_settled_cost() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();
        service.find_and_lock_for_scheduling().await.unwrap();
        service.set_scheduled(id, "exec-1", None, vec![]).await.unwrap();
        service.set_running(id).await.unwrap();

        assert!(service.deletable_jobs().await.unwrap().is_empty());

        service.mark_cancelled_and_deleted(id).await.unwrap();
        // Not terminal yet.
        assert!(service.deletable_jobs().await.unwrap().is_empty());

        service.set_and_publish_cancelled(id).await.unwrap();
        assert_eq!(service.deletable_jobs().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_delete_job_revokes_acl() {
        let (service, publisher) = service();
        let id = submitted_job(&service).await;

        assert!(service.delete_job(id).await.unwrap());
        assert_eq!(publisher.revoked.lock().unwrap().as_slice(), &[id]);

        // Second delete is a no-op with no second notification.
        assert!(!service.delete_job(id).await.unwrap());
        assert_eq!(publisher.revoked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_scheduling_claims_single_winner() {
        let (service, _) = service();
        let id = submitted_job(&service).await;
        service.mark_ready_for_scheduling(id).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.find_and_lock_for_scheduling().await.unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
