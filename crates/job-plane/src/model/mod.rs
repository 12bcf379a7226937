//! The job document model.

mod job;

pub use job::{
    CancellationInfo, ConsumedResource, ExecutionKind, ExecutionRecord, GpuRequest, GpuState, Job,
    JobCost, JobExecutions, JobState, ResourceRequest, StateGroup, StepBranch, StepDetail,
    StepState,
};
