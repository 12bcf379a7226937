//! HTTP clients for external collaborators.

mod credits;
mod workflow;

pub use credits::{CreditsClient, HttpCreditsClient};
pub use workflow::{ExecutionAnnotations, FlyteClient, ResolvedExecution, WorkflowEngine};
