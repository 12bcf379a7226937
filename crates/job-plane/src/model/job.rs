//! The job document: the central entity tracked by the state machine.
//!
//! A job moves forward along a fixed state graph. The numeric state codes
//! are stable wire values persisted in the store and reported to clients;
//! they never change meaning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job.
///
/// States only move forward along the graph: the main pipeline runs
/// submission through `Running` to terminal `Finished`; a failed or
/// cancelled main execution is routed into the revert sub-pipeline, whose
/// outcome decides between terminal `Failed` and `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum JobState {
    Submitted,
    ReadyForScheduling,
    SchedulingLocked,
    Scheduled,
    Running,
    CancelingLocked,
    ReadyForRevert,
    RevertSchedulingLocked,
    RevertScheduled,
    RevertRunning,
    Finished,
    Failed,
    Cancelled,
}

impl JobState {
    /// Every non-terminal state.
    pub const ACTIVE: &'static [JobState] = &[
        JobState::Submitted,
        JobState::ReadyForScheduling,
        JobState::SchedulingLocked,
        JobState::Scheduled,
        JobState::Running,
        JobState::CancelingLocked,
        JobState::ReadyForRevert,
        JobState::RevertSchedulingLocked,
        JobState::RevertScheduled,
        JobState::RevertRunning,
    ];

    /// Non-terminal states of the main pipeline (a late main-workflow
    /// SUCCEEDED event must not finish a job already reverting).
    pub const MAIN_ACTIVE: &'static [JobState] = &[
        JobState::Submitted,
        JobState::ReadyForScheduling,
        JobState::SchedulingLocked,
        JobState::Scheduled,
        JobState::Running,
        JobState::CancelingLocked,
    ];

    /// Stable numeric wire code.
    pub fn code(self) -> i32 {
        match self {
            JobState::Submitted => 0,
            JobState::ReadyForScheduling => 1,
            JobState::SchedulingLocked => 2,
            JobState::Scheduled => 3,
            JobState::Running => 4,
            JobState::CancelingLocked => 5,
            JobState::ReadyForRevert => 6,
            JobState::RevertSchedulingLocked => 7,
            JobState::RevertScheduled => 8,
            JobState::RevertRunning => 9,
            JobState::Finished => 100,
            JobState::Failed => 101,
            JobState::Cancelled => 102,
        }
    }

    /// Coarse state classification.
    ///
    /// `CancelingLocked` returns `None`: it preserves whichever group the
    /// job had when the cancel worker claimed it.
    pub fn group(self) -> Option<StateGroup> {
        match self {
            JobState::Submitted
            | JobState::ReadyForScheduling
            | JobState::SchedulingLocked
            | JobState::Scheduled
            | JobState::ReadyForRevert
            | JobState::RevertSchedulingLocked
            | JobState::RevertScheduled => Some(StateGroup::Scheduled),
            JobState::Running | JobState::RevertRunning => Some(StateGroup::Running),
            JobState::CancelingLocked => None,
            JobState::Finished => Some(StateGroup::Finished),
            JobState::Failed => Some(StateGroup::Failed),
            JobState::Cancelled => Some(StateGroup::Cancelled),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Cancelled
        )
    }
}

impl From<JobState> for i32 {
    fn from(state: JobState) -> i32 {
        state.code()
    }
}

impl TryFrom<i32> for JobState {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(JobState::Submitted),
            1 => Ok(JobState::ReadyForScheduling),
            2 => Ok(JobState::SchedulingLocked),
            3 => Ok(JobState::Scheduled),
            4 => Ok(JobState::Running),
            5 => Ok(JobState::CancelingLocked),
            6 => Ok(JobState::ReadyForRevert),
            7 => Ok(JobState::RevertSchedulingLocked),
            8 => Ok(JobState::RevertScheduled),
            9 => Ok(JobState::RevertRunning),
            100 => Ok(JobState::Finished),
            101 => Ok(JobState::Failed),
            102 => Ok(JobState::Cancelled),
            _ => Err(format!("Unknown job state code: {}", code)),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Submitted => "SUBMITTED",
            JobState::ReadyForScheduling => "READY_FOR_SCHEDULING",
            JobState::SchedulingLocked => "SCHEDULING_LOCKED",
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::CancelingLocked => "CANCELING_LOCKED",
            JobState::ReadyForRevert => "READY_FOR_REVERT",
            JobState::RevertSchedulingLocked => "REVERT_SCHEDULING_LOCKED",
            JobState::RevertScheduled => "REVERT_SCHEDULED",
            JobState::RevertRunning => "REVERT_RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Coarse classification of `JobState` used for dashboarding and for
/// scoping step-detail bulk updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateGroup {
    Scheduled,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl StateGroup {
    pub const TERMINAL: &'static [StateGroup] = &[
        StateGroup::Finished,
        StateGroup::Failed,
        StateGroup::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StateGroup::Scheduled => "SCHEDULED",
            StateGroup::Running => "RUNNING",
            StateGroup::Finished => "FINISHED",
            StateGroup::Failed => "FAILED",
            StateGroup::Cancelled => "CANCELLED",
        }
    }

    /// The non-locked state a job returns to when a canceling lock is
    /// released without the cancellation completing.
    pub fn unlocked_state(self) -> JobState {
        match self {
            StateGroup::Running => JobState::Running,
            // Terminal groups never hold a canceling lock; treat anything
            // else as the scheduled-group restore target.
            _ => JobState::Scheduled,
        }
    }
}

impl std::fmt::Display for StateGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which of the two workflow executions backing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionKind {
    Main,
    Revert,
}

impl ExecutionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionKind::Main => "MAIN",
            ExecutionKind::Revert => "REVERT",
        }
    }
}

impl std::str::FromStr for ExecutionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MAIN" => Ok(ExecutionKind::Main),
            "REVERT" => Ok(ExecutionKind::Revert),
            _ => Err(format!("Unknown execution type: {}", s)),
        }
    }
}

/// One workflow-engine execution backing a job (main or revert).
///
/// `process_start_time` is the lock timestamp: non-null only while a worker
/// holds the job for dispatch or cancellation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: i32,
}

/// The main and revert execution sub-records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobExecutions {
    #[serde(default)]
    pub main: ExecutionRecord,
    #[serde(default)]
    pub revert: ExecutionRecord,
}

impl JobExecutions {
    pub fn record(&self, kind: ExecutionKind) -> &ExecutionRecord {
        match kind {
            ExecutionKind::Main => &self.main,
            ExecutionKind::Revert => &self.revert,
        }
    }

    pub fn record_mut(&mut self, kind: ExecutionKind) -> &mut ExecutionRecord {
        match kind {
            ExecutionKind::Main => &mut self.main,
            ExecutionKind::Revert => &mut self.revert,
        }
    }
}

/// State of a single task step within a job's execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Waiting,
    Running,
    Finished,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepState::Waiting => "WAITING",
            StepState::Running => "RUNNING",
            StepState::Finished => "FINISHED",
            StepState::Failed => "FAILED",
            StepState::Skipped => "SKIPPED",
            StepState::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// A conditional branch attached to a step, used when the workflow
/// contains branching nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBranch {
    /// Name of the branch node (the condition) in the workflow.
    pub condition: String,
    /// The branch this step belongs to.
    pub branch: String,
    /// Message recorded on the step when its branch is not taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_message: Option<String>,
}

/// One unit of work within a job's execution plan, independently tracked.
///
/// `task_id` is stable and unique within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    pub task_id: String,
    pub name: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<StepBranch>,
}

impl StepDetail {
    /// Create a step in the waiting state.
    pub fn waiting(task_id: &str, name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            name: name.to_string(),
            state: StepState::Waiting,
            progress: None,
            message: None,
            warning: None,
            branches: Vec::new(),
        }
    }
}

/// Cooperative-cancellation bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancellationInfo {
    #[serde(default)]
    pub is_cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_time: Option<DateTime<Utc>>,
    /// Job is slated for physical deletion once terminal and billed.
    #[serde(default)]
    pub delete_job: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_time: Option<DateTime<Utc>>,
    /// Times a cancel attempt timed out and was released for retry.
    #[serde(default)]
    pub cancel_retry_count: i32,
}

/// A resource amount reserved at admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub amount: i64,
    pub unit: String,
}

/// A resource-consumption record appended while the job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumedResource {
    pub amount: i64,
    pub unit: String,
    pub consuming_date: DateTime<Utc>,
    pub service: String,
}

/// Billing/reservation state for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCost {
    /// Resources reserved at admission.
    #[serde(default)]
    pub requests: Vec<ResourceRequest>,
    /// External reservation handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// Append-only consumption records.
    #[serde(default)]
    pub consumed: Vec<ConsumedResource>,
    /// At-most-once billing guarantee: flips to true exactly once.
    #[serde(default)]
    pub reported: bool,
}

impl JobCost {
    /// Units the job is allowed to consume against.
    pub fn requested_units(&self) -> impl Iterator<Item = &str> {
        self.requests.iter().map(|r| r.unit.as_str())
    }
}

/// GPU reservation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpuState {
    Reserved,
    Released,
}

/// GPU request record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuRequest {
    pub num_required: u32,
    pub state: GpuState,
}

/// The central entity: one asynchronous workload tracked from submission
/// through terminal accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub project_id: String,
    pub workspace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub state: JobState,
    pub state_group: StateGroup,
    #[serde(default)]
    pub executions: JobExecutions,
    #[serde(default)]
    pub step_details: Vec<StepDetail>,
    #[serde(default)]
    pub cancellation_info: CancellationInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<JobCost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub payload: serde_json::Value,
    pub creation_time: DateTime<Utc>,
}

impl Job {
    /// Create a freshly submitted job.
    pub fn new(
        id: Uuid,
        job_type: &str,
        project_id: &str,
        workspace_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            job_type: job_type.to_string(),
            project_id: project_id.to_string(),
            workspace_id: workspace_id.to_string(),
            session_id: None,
            state: JobState::Submitted,
            state_group: StateGroup::Scheduled,
            executions: JobExecutions::default(),
            step_details: Vec::new(),
            cancellation_info: CancellationInfo::default(),
            cost: None,
            gpu: None,
            start_time: None,
            end_time: None,
            metadata: serde_json::Map::new(),
            payload,
            creation_time: Utc::now(),
        }
    }

    /// Whether billing no longer owes anything for this job: either no cost
    /// record exists, or its cost has been reported.
    pub fn cost_settled(&self) -> bool {
        self.cost.as_ref().map(|c| c.reported).unwrap_or(true)
    }

    pub fn step(&self, task_id: &str) -> Option<&StepDetail> {
        self.step_details.iter().find(|s| s.task_id == task_id)
    }
}
