//! In-memory job store.
//!
//! The test double for the conditional-update contract; also usable for
//! single-process local runs. Shares the mutation interpreter with the
//! PostgreSQL store, so conditional semantics are identical.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{Job, StepState};
use crate::store::{apply_mutations, JobFilter, JobMutation, JobStore, StepPatch};

/// Mutex-held map of job documents.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        // Lock poisoning only happens if a writer panicked; the map is
        // still structurally sound, so keep serving.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> AppResult<()> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(AppError::Validation(format!(
                "Job already exists: {}",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Job>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn find_one_and_update(
        &self,
        filter: &JobFilter,
        mutations: &[JobMutation],
    ) -> AppResult<Option<Job>> {
        let mut jobs = self.lock();
        let job = jobs.values_mut().find(|job| filter.matches(job));
        match job {
            Some(job) => {
                apply_mutations(job, mutations);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_many_if(
        &self,
        filter: &JobFilter,
        mutations: &[JobMutation],
    ) -> AppResult<u64> {
        let mut jobs = self.lock();
        let mut count = 0;
        for job in jobs.values_mut().filter(|job| filter.matches(job)) {
            apply_mutations(job, mutations);
            count += 1;
        }
        Ok(count)
    }

    async fn update_step(&self, id: Uuid, task_id: &str, patch: &StepPatch) -> AppResult<bool> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        match job.step_details.iter_mut().find(|s| s.task_id == task_id) {
            Some(step) => {
                patch.apply(step);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_steps_in_states(
        &self,
        id: Uuid,
        from: &[StepState],
        to: StepState,
    ) -> AppResult<u64> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(0);
        };
        let mut count = 0;
        for step in job
            .step_details
            .iter_mut()
            .filter(|s| from.contains(&s.state))
        {
            step.state = to;
            count += 1;
        }
        Ok(count)
    }

    async fn delete(&self, id: Uuid) -> AppResult<bool> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn find_ids(&self, filter: &JobFilter) -> AppResult<Vec<Uuid>> {
        Ok(self
            .lock()
            .values()
            .filter(|job| filter.matches(job))
            .map(|job| job.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobState, StepDetail};
    use serde_json::json;

    fn store_with_job(state: JobState) -> (MemoryJobStore, Uuid) {
        let store = MemoryJobStore::new();
        let mut job = Job::new(
            Uuid::new_v4(),
            "train",
            "project-1",
            "workspace-1",
            json!({}),
        );
        job.state = state;
        if let Some(group) = state.group() {
            job.state_group = group;
        }
        let id = job.id;
        store.lock().insert(id, job);
        (store, id)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate() {
        let store = MemoryJobStore::new();
        let job = Job::new(Uuid::new_v4(), "t", "p", "w", json!({}));
        store.insert(&job).await.unwrap();
        assert!(store.insert(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_conditional_update_applies_once() {
        let (store, id) = store_with_job(JobState::ReadyForScheduling);
        let filter = JobFilter::new().in_state(JobState::ReadyForScheduling);
        let mutations = [JobMutation::SetState(JobState::SchedulingLocked)];

        let claimed = store.find_one_and_update(&filter, &mutations).await.unwrap();
        assert_eq!(claimed.unwrap().id, id);

        // Already claimed: filter no longer matches.
        let again = store.find_one_and_update(&filter, &mutations).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_update_if_checks_expected_state() {
        let (store, id) = store_with_job(JobState::Scheduled);
        let applied = store
            .update_if(
                id,
                &JobFilter::new().in_state(JobState::Running),
                &[JobMutation::SetState(JobState::Finished)],
            )
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn test_update_step_by_task_id() {
        let (store, id) = store_with_job(JobState::Running);
        {
            let mut jobs = store.lock();
            let job = jobs.get_mut(&id).unwrap();
            job.step_details = vec![
                StepDetail::waiting("t1", "Prepare"),
                StepDetail::waiting("t2", "Train"),
            ];
        }

        let applied = store
            .update_step(
                id,
                "t2",
                &StepPatch {
                    state: Some(StepState::Running),
                    progress: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(applied);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.step("t1").unwrap().state, StepState::Waiting);
        assert_eq!(job.step("t2").unwrap().state, StepState::Running);
        assert_eq!(job.step("t2").unwrap().progress, Some(10));

        let missing = store
            .update_step(id, "nope", &StepPatch::default())
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn test_bulk_step_transition() {
        let (store, id) = store_with_job(JobState::Running);
        {
            let mut jobs = store.lock();
            let job = jobs.get_mut(&id).unwrap();
            let mut done = StepDetail::waiting("t1", "Prepare");
            done.state = StepState::Finished;
            job.step_details = vec![
                done,
                StepDetail::waiting("t2", "Train"),
                StepDetail::waiting("t3", "Export"),
            ];
        }

        let count = store
            .update_steps_in_states(
                id,
                &[StepState::Waiting, StepState::Running],
                StepState::Cancelled,
            )
            .await
            .unwrap();
        assert_eq!(count, 2);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.step("t1").unwrap().state, StepState::Finished);
        assert_eq!(job.step("t2").unwrap().state, StepState::Cancelled);
        assert_eq!(job.step("t3").unwrap().state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_winner() {
        let (store, _id) = store_with_job(JobState::ReadyForScheduling);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let filter = JobFilter::new()
                    .in_state(JobState::ReadyForScheduling)
                    .cancelled(false);
                store
                    .find_one_and_update(
                        &filter,
                        &[JobMutation::SetState(JobState::SchedulingLocked)],
                    )
                    .await
                    .unwrap()
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
