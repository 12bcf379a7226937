//! The Job Store abstraction.
//!
//! Every state transition in the lifecycle service is an atomic conditional
//! update: find the document still matching an expected-state filter and
//! mutate it in the same step. The trait below is that contract, independent
//! of the storage engine, so the state-machine logic runs unchanged against
//! PostgreSQL in production and an in-memory fake in tests.
//!
//! Mutations are a closed set interpreted by [`JobMutation::apply`]; both
//! store implementations funnel through the same interpreter, so conditional
//! semantics cannot drift between them.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::{
    ConsumedResource, ExecutionKind, ExecutionRecord, GpuState, Job, JobState, StateGroup,
    StepDetail, StepState,
};

/// Expected-state filter for conditional updates.
///
/// Empty vectors match any value; `None` options are not checked.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub id: Option<Uuid>,
    pub states: Vec<JobState>,
    pub state_groups: Vec<StateGroup>,
    pub is_cancelled: Option<bool>,
    pub delete_job: Option<bool>,
    /// Matches [`Job::cost_settled`]: reported, or no cost at all.
    pub cost_settled: Option<bool>,
    pub project_id: Option<String>,
    pub main_locked_before: Option<DateTime<Utc>>,
    pub revert_locked_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn in_state(self, state: JobState) -> Self {
        self.in_states(&[state])
    }

    pub fn in_states(mut self, states: &[JobState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn in_groups(mut self, groups: &[StateGroup]) -> Self {
        self.state_groups = groups.to_vec();
        self
    }

    pub fn cancelled(mut self, value: bool) -> Self {
        self.is_cancelled = Some(value);
        self
    }

    pub fn slated_for_deletion(mut self, value: bool) -> Self {
        self.delete_job = Some(value);
        self
    }

    pub fn cost_settled(mut self, value: bool) -> Self {
        self.cost_settled = Some(value);
        self
    }

    pub fn in_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn main_locked_before(mut self, threshold: DateTime<Utc>) -> Self {
        self.main_locked_before = Some(threshold);
        self
    }

    pub fn revert_locked_before(mut self, threshold: DateTime<Utc>) -> Self {
        self.revert_locked_before = Some(threshold);
        self
    }

    /// Evaluate the filter against a job document.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(id) = self.id {
            if job.id != id {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        if !self.state_groups.is_empty() && !self.state_groups.contains(&job.state_group) {
            return false;
        }
        if let Some(cancelled) = self.is_cancelled {
            if job.cancellation_info.is_cancelled != cancelled {
                return false;
            }
        }
        if let Some(delete) = self.delete_job {
            if job.cancellation_info.delete_job != delete {
                return false;
            }
        }
        if let Some(settled) = self.cost_settled {
            if job.cost_settled() != settled {
                return false;
            }
        }
        if let Some(project_id) = &self.project_id {
            if &job.project_id != project_id {
                return false;
            }
        }
        if let Some(threshold) = self.main_locked_before {
            match job.executions.main.process_start_time {
                Some(lock) if lock < threshold => {}
                _ => return false,
            }
        }
        if let Some(threshold) = self.revert_locked_before {
            match job.executions.revert.process_start_time {
                Some(lock) if lock < threshold => {}
                _ => return false,
            }
        }
        true
    }
}

/// One mutation applied to a job document as part of a conditional update.
#[derive(Debug, Clone)]
pub enum JobMutation {
    /// Set the state; the state group follows unless the state preserves
    /// the prior group (`CancelingLocked`).
    SetState(JobState),
    /// Restore the non-locked state implied by the job's current group.
    RestoreUnlockedState,
    /// Set the lock timestamp on one execution.
    Lock(ExecutionKind, DateTime<Utc>),
    /// Clear the lock timestamp on one execution.
    ClearLock(ExecutionKind),
    /// Increment one execution's retry counter.
    BumpRetry(ExecutionKind),
    /// Increment the cancel-attempt retry counter.
    BumpCancelRetry,
    SetMainExecution {
        execution_id: String,
        launch_plan_id: Option<String>,
    },
    SetRevertExecution {
        execution_id: String,
    },
    /// Reset the revert sub-record to empty.
    ResetRevertExecution,
    /// Materialize the step plan (submission/scheduling time only; progress
    /// updates go through the array-scoped step operations instead).
    SetStepDetails(Vec<StepDetail>),
    SetStartTime(DateTime<Utc>),
    SetEndTime(DateTime<Utc>),
    SetCancelled {
        request_time: DateTime<Utc>,
    },
    SetCancelTime(DateTime<Utc>),
    ClearCancelled,
    SetDeleteJob,
    /// Non-destructive key union into the metadata map.
    MergeMetadata(serde_json::Map<String, serde_json::Value>),
    /// Append consumption records; records whose unit was never requested
    /// are silently dropped.
    AppendConsumed(Vec<ConsumedResource>),
    SetCostReported,
    SetGpuState(GpuState),
}

impl JobMutation {
    /// Apply this mutation to a job document.
    pub fn apply(&self, job: &mut Job) {
        match self {
            JobMutation::SetState(state) => {
                job.state = *state;
                if let Some(group) = state.group() {
                    job.state_group = group;
                }
            }
            JobMutation::RestoreUnlockedState => {
                job.state = job.state_group.unlocked_state();
            }
            JobMutation::Lock(kind, ts) => {
                job.executions.record_mut(*kind).process_start_time = Some(*ts);
            }
            JobMutation::ClearLock(kind) => {
                job.executions.record_mut(*kind).process_start_time = None;
            }
            JobMutation::BumpRetry(kind) => {
                job.executions.record_mut(*kind).retry_count += 1;
            }
            JobMutation::BumpCancelRetry => {
                job.cancellation_info.cancel_retry_count += 1;
            }
            JobMutation::SetMainExecution {
                execution_id,
                launch_plan_id,
            } => {
                job.executions.main.execution_id = Some(execution_id.clone());
                job.executions.main.launch_plan_id = launch_plan_id.clone();
            }
            JobMutation::SetRevertExecution { execution_id } => {
                job.executions.revert.execution_id = Some(execution_id.clone());
            }
            JobMutation::ResetRevertExecution => {
                job.executions.revert = ExecutionRecord::default();
            }
            JobMutation::SetStepDetails(steps) => {
                job.step_details = steps.clone();
            }
            JobMutation::SetStartTime(ts) => {
                job.start_time = Some(*ts);
            }
            JobMutation::SetEndTime(ts) => {
                job.end_time = Some(*ts);
            }
            JobMutation::SetCancelled { request_time } => {
                job.cancellation_info.is_cancelled = true;
                job.cancellation_info.request_time = Some(*request_time);
            }
            JobMutation::SetCancelTime(ts) => {
                job.cancellation_info.cancel_time = Some(*ts);
            }
            JobMutation::ClearCancelled => {
                job.cancellation_info.is_cancelled = false;
            }
            JobMutation::SetDeleteJob => {
                job.cancellation_info.delete_job = true;
            }
            JobMutation::MergeMetadata(patch) => {
                for (key, value) in patch {
                    job.metadata.insert(key.clone(), value.clone());
                }
            }
            JobMutation::AppendConsumed(records) => {
                if let Some(cost) = &mut job.cost {
                    for record in records {
                        if cost.requests.iter().any(|r| r.unit == record.unit) {
                            cost.consumed.push(record.clone());
                        }
                    }
                }
            }
            JobMutation::SetCostReported => {
                if let Some(cost) = &mut job.cost {
                    cost.reported = true;
                }
            }
            JobMutation::SetGpuState(state) => {
                if let Some(gpu) = &mut job.gpu {
                    gpu.state = *state;
                }
            }
        }
    }
}

/// Apply a mutation list in order.
pub fn apply_mutations(job: &mut Job, mutations: &[JobMutation]) {
    for mutation in mutations {
        mutation.apply(job);
    }
}

/// Partial update of a single step, matched by `task_id`.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub state: Option<StepState>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub warning: Option<String>,
}

impl StepPatch {
    /// Apply the patch to one step in place.
    pub fn apply(&self, step: &mut StepDetail) {
        if let Some(state) = self.state {
            step.state = state;
        }
        if let Some(progress) = self.progress {
            step.progress = Some(progress.min(100));
        }
        if let Some(message) = &self.message {
            step.message = Some(message.clone());
        }
        if let Some(warning) = &self.warning {
            step.warning = Some(warning.clone());
        }
    }
}

/// Storage contract for job documents.
///
/// All write operations are atomic conditional read-modify-writes: the
/// filter is evaluated and the mutations applied under the same lock, and
/// a non-matching filter means no write happened.
pub trait JobStore: Send + Sync {
    /// Insert a new job document.
    fn insert(&self, job: &Job) -> impl std::future::Future<Output = AppResult<()>> + Send;

    /// Load a job by id.
    fn get(&self, id: Uuid) -> impl std::future::Future<Output = AppResult<Option<Job>>> + Send;

    /// Atomically claim and mutate one job matching the filter; returns the
    /// updated document, or `None` when no job matched.
    fn find_one_and_update(
        &self,
        filter: &JobFilter,
        mutations: &[JobMutation],
    ) -> impl std::future::Future<Output = AppResult<Option<Job>>> + Send;

    /// Conditionally update one job by id; returns whether the write applied.
    fn update_if(
        &self,
        id: Uuid,
        filter: &JobFilter,
        mutations: &[JobMutation],
    ) -> impl std::future::Future<Output = AppResult<bool>> + Send
    where
        Self: Sized,
    {
        let filter = filter.clone().with_id(id);
        let mutations = mutations.to_vec();
        async move {
            Ok(self
                .find_one_and_update(&filter, &mutations)
                .await?
                .is_some())
        }
    }

    /// Conditionally update every job matching the filter; returns the
    /// number of jobs changed.
    fn update_many_if(
        &self,
        filter: &JobFilter,
        mutations: &[JobMutation],
    ) -> impl std::future::Future<Output = AppResult<u64>> + Send;

    /// Array-scoped update of one step, matched by `task_id`. Never
    /// replaces the whole step list.
    fn update_step(
        &self,
        id: Uuid,
        task_id: &str,
        patch: &StepPatch,
    ) -> impl std::future::Future<Output = AppResult<bool>> + Send;

    /// Bulk-transition every step currently in one of `from` to `to`;
    /// returns the number of steps changed.
    fn update_steps_in_states(
        &self,
        id: Uuid,
        from: &[StepState],
        to: StepState,
    ) -> impl std::future::Future<Output = AppResult<u64>> + Send;

    /// Hard-delete a job; returns whether it existed.
    fn delete(&self, id: Uuid) -> impl std::future::Future<Output = AppResult<bool>> + Send;

    /// Ids of every job matching the filter.
    fn find_ids(
        &self,
        filter: &JobFilter,
    ) -> impl std::future::Future<Output = AppResult<Vec<Uuid>>> + Send;
}
