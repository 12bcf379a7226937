//! Wire shapes consumed by the progress pipeline.
//!
//! Engine events arrive as Flyte-style `*EventRequest` messages: a
//! `ce_type` header naming the granularity and a JSON body wrapping the
//! event in an `{"event": {...}}` envelope. Everything is validated here,
//! at the ingestion boundary; handlers downstream only see typed events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{ConsumedResource, GpuState, StepState};

pub const CE_TYPE_HEADER: &str = "ce_type";
pub const CE_WORKFLOW_EVENT: &str = "WorkflowExecutionEventRequest";
pub const CE_NODE_EVENT: &str = "NodeExecutionEventRequest";
pub const CE_TASK_EVENT: &str = "TaskExecutionEventRequest";

/// Execution phase reported by the engine. Phases we do not act on all
/// collapse into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Queued => "QUEUED",
            Phase::Running => "RUNNING",
            Phase::Succeeded => "SUCCEEDED",
            Phase::Failed => "FAILED",
            Phase::Aborted => "ABORTED",
            Phase::Other => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// The engine's name for an execution; resolvable through the workflow
/// engine to a job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionIdentifier {
    pub name: String,
}

/// Error payload attached to failed task events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Workflow-granularity event: the whole main or revert pipeline changed
/// phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub execution_id: ExecutionIdentifier,
    pub phase: Phase,
}

/// Node-granularity event; only queued branch nodes are significant.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    pub execution_id: ExecutionIdentifier,
    pub phase: Phase,
    #[serde(default)]
    pub node_name: Option<String>,
}

/// Task-granularity event: one step of the plan changed phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub execution_id: ExecutionIdentifier,
    pub phase: Phase,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub parent_node: Option<String>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

/// Tagged union over the three engine event granularities.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Workflow(WorkflowEvent),
    Node(NodeEvent),
    Task(TaskEvent),
}

impl EngineEvent {
    pub fn execution_name(&self) -> &str {
        match self {
            EngineEvent::Workflow(e) => &e.execution_id.name,
            EngineEvent::Node(e) => &e.execution_id.name,
            EngineEvent::Task(e) => &e.execution_id.name,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    event: T,
}

fn parse_envelope<T: DeserializeOwned>(payload: &[u8]) -> AppResult<T> {
    serde_json::from_slice::<Envelope<T>>(payload)
        .map(|e| e.event)
        .map_err(|e| AppError::Parse(format!("Invalid engine event body: {}", e)))
}

/// Parse an engine event from its `ce_type` header and JSON body.
pub fn parse_engine_event(ce_type: &str, payload: &[u8]) -> AppResult<EngineEvent> {
    match ce_type {
        CE_WORKFLOW_EVENT => Ok(EngineEvent::Workflow(parse_envelope(payload)?)),
        CE_NODE_EVENT => Ok(EngineEvent::Node(parse_envelope(payload)?)),
        CE_TASK_EVENT => Ok(EngineEvent::Task(parse_envelope(payload)?)),
        other => Err(AppError::Parse(format!("Unknown event type: {}", other))),
    }
}

/// Free-form step progress update, keyed by execution id.
#[derive(Debug, Clone, Deserialize)]
pub struct StepDetailsUpdate {
    pub execution_id: String,
    pub task_id: String,
    #[serde(default)]
    pub state: Option<StepState>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

/// GPU reservation change in a side-channel update.
#[derive(Debug, Clone, Deserialize)]
pub struct GpuUpdate {
    pub state: GpuState,
}

/// Metadata/cost/GPU side-channel update, keyed by execution id.
#[derive(Debug, Clone, Deserialize)]
pub struct JobUpdate {
    pub execution_id: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub cost: Option<Vec<ConsumedResource>>,
    #[serde(default)]
    pub gpu: Option<GpuUpdate>,
}

/// Project deletion notice.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDeleted {
    pub project_id: String,
}

/// Terminal job notice consumed for cost accounting. The full outcome
/// event carries more, but accounting only needs the job.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalNotice {
    pub job_id: Uuid,
}

/// Parse a plain JSON message body.
pub fn parse_message<T: DeserializeOwned>(payload: &[u8]) -> AppResult<T> {
    serde_json::from_slice(payload).map_err(|e| AppError::Parse(format!("Invalid message: {}", e)))
}
