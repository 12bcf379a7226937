//! Event ingestion: typed wire shapes and the progress handler.

pub mod progress;
pub mod types;

pub use progress::{sanitize_failure_message, ProgressHandler};
pub use types::{
    parse_engine_event, parse_message, EngineEvent, ExecutionError, ExecutionIdentifier, JobUpdate,
    NodeEvent, Phase, ProjectDeleted, StepDetailsUpdate, TaskEvent, TerminalNotice, WorkflowEvent,
};
