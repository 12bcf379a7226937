//! Event-driven progress pipeline.
//!
//! Consumes the engine event stream plus the side-channel subjects and
//! turns them into state-machine calls. Handlers return `Ok(())` for
//! anything that should be dropped (unknown execution, late event, phase
//! we do not act on); only external failures propagate, so the message
//! bus redelivers exactly the work that can still succeed.

use tracing::Instrument;
use uuid::Uuid;

use crate::clients::{CreditsClient, ExecutionAnnotations, WorkflowEngine};
use crate::error::AppResult;
use crate::events::types::{
    parse_engine_event, parse_message, EngineEvent, ExecutionError, JobUpdate, NodeEvent, Phase,
    ProjectDeleted, StepDetailsUpdate, TaskEvent, TerminalNotice, WorkflowEvent,
};
use crate::model::{ExecutionKind, GpuState, Job, StepState};
use crate::services::cost::{CostService, MeteringPublisher};
use crate::services::lifecycle::{LifecycleService, OutcomePublisher};
use crate::services::templates::{StepTemplate, StepTemplateRegistry};
use crate::store::{JobStore, StepPatch};

/// Fixed user-facing message substituted for out-of-memory container kills.
const OOM_MESSAGE: &str =
    "The job ran out of memory. Reduce the workload size or contact support.";

/// Resolve a user-facing failure message for a failed task.
///
/// Known infrastructure signatures win over everything; otherwise the
/// job-type template message (with the job id interpolated) beats the raw
/// phase label.
pub fn sanitize_failure_message(
    error: Option<&ExecutionError>,
    template: Option<&StepTemplate>,
    job_id: Uuid,
    phase: Phase,
) -> String {
    if let Some(error) = error {
        let oom_code = error.code.as_deref() == Some("OOMKilled");
        let oom_message = error
            .message
            .as_deref()
            .map(|m| m.contains("exit code 137"))
            .unwrap_or(false);
        if oom_code || oom_message {
            return OOM_MESSAGE.to_string();
        }
    }
    if let Some(message) = template.and_then(|t| t.failure_message.as_ref()) {
        return message.replace("{job_id}", &job_id.to_string());
    }
    phase.to_string()
}

/// The message-bus consumer's handler side: one instance per process,
/// shared across subjects.
#[derive(Clone)]
pub struct ProgressHandler<S, P, W, T, M, C> {
    lifecycle: LifecycleService<S, P>,
    cost: CostService<S, M, C>,
    engine: W,
    templates: T,
}

impl<S, P, W, T, M, C> ProgressHandler<S, P, W, T, M, C>
where
    S: JobStore + Clone,
    P: OutcomePublisher,
    W: WorkflowEngine,
    T: StepTemplateRegistry,
    M: MeteringPublisher,
    C: CreditsClient,
{
    pub fn new(
        lifecycle: LifecycleService<S, P>,
        cost: CostService<S, M, C>,
        engine: W,
        templates: T,
    ) -> Self {
        Self {
            lifecycle,
            cost,
            engine,
            templates,
        }
    }

    /// Entry point for the engine event stream.
    pub async fn on_engine_event(&self, ce_type: &str, payload: &[u8]) -> AppResult<()> {
        let event = parse_engine_event(ce_type, payload)?;

        let Some(execution) = self.engine.fetch_execution(event.execution_name()).await? else {
            tracing::warn!(
                execution = %event.execution_name(),
                "Event for unknown execution dropped"
            );
            return Ok(());
        };

        let annotations = execution.annotations;
        let span = tracing::info_span!(
            "engine_event",
            job_id = %annotations.job_id,
            organization_id = %annotations.organization_id,
            workspace_id = %annotations.workspace_id,
        );
        self.route_engine_event(annotations, event).instrument(span).await
    }

    async fn route_engine_event(
        &self,
        annotations: ExecutionAnnotations,
        event: EngineEvent,
    ) -> AppResult<()> {
        let Some(job) = self.lifecycle.store().get(annotations.job_id).await? else {
            tracing::warn!("Event for unknown job dropped");
            return Ok(());
        };

        match event {
            EngineEvent::Workflow(e) => {
                self.on_workflow_event(&job, annotations.execution_type, e)
                    .await
            }
            EngineEvent::Node(e) => {
                self.on_node_event(&job, annotations.execution_type, e).await
            }
            EngineEvent::Task(e) => {
                self.on_task_event(&job, annotations.execution_type, e).await
            }
        }
    }

    async fn on_workflow_event(
        &self,
        job: &Job,
        kind: ExecutionKind,
        event: WorkflowEvent,
    ) -> AppResult<()> {
        match (kind, event.phase) {
            (ExecutionKind::Main, Phase::Running) => {
                self.lifecycle.set_running(job.id).await?;
            }
            (ExecutionKind::Main, Phase::Succeeded) => {
                self.lifecycle.set_and_publish_finished(job.id).await?;
            }
            (ExecutionKind::Main, Phase::Failed | Phase::Aborted) => {
                self.lifecycle.set_ready_for_revert(job.id).await?;
            }
            (ExecutionKind::Revert, Phase::Running) => {
                self.lifecycle.set_revert_running(job.id).await?;
            }
            (ExecutionKind::Revert, Phase::Succeeded | Phase::Failed) => {
                let info = &job.cancellation_info;
                if info.is_cancelled && !info.delete_job {
                    self.lifecycle.set_and_publish_cancelled(job.id).await?;
                } else {
                    self.lifecycle.set_and_publish_failed(job.id).await?;
                }
            }
            _ => {
                tracing::debug!(phase = %event.phase, "Ignored workflow phase");
            }
        }
        Ok(())
    }

    /// Branch-node handling: when a branch node is queued, every template
    /// step sitting on a branch that was not taken gets skipped.
    async fn on_node_event(
        &self,
        job: &Job,
        kind: ExecutionKind,
        event: NodeEvent,
    ) -> AppResult<()> {
        if kind == ExecutionKind::Revert {
            return Ok(());
        }
        if event.phase != Phase::Queued {
            return Ok(());
        }
        let Some(node_name) = &event.node_name else {
            return Ok(());
        };
        let Some(steps) = self.templates.job_steps(&job.job_type) else {
            return Ok(());
        };
        if !steps
            .iter()
            .any(|s| s.branches.iter().any(|b| &b.condition == node_name))
        {
            return Ok(());
        }

        let selections = self.engine.branch_selections(&event.execution_id.name).await?;

        for step in steps {
            for branch in &step.branches {
                if &branch.condition != node_name {
                    continue;
                }
                let Some(taken) = selections.get(&branch.condition) else {
                    continue;
                };
                if taken != &branch.branch {
                    self.lifecycle
                        .set_step_details(
                            job.id,
                            &step.task_id,
                            &StepPatch {
                                state: Some(StepState::Skipped),
                                message: branch.skip_message.clone(),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn on_task_event(
        &self,
        job: &Job,
        kind: ExecutionKind,
        event: TaskEvent,
    ) -> AppResult<()> {
        // Revert steps are cleanup plumbing, never surfaced to users.
        if kind == ExecutionKind::Revert {
            return Ok(());
        }
        let (Some(task_id), Some(_parent)) = (&event.task_id, &event.parent_node) else {
            tracing::debug!("Task event without task/parent reference dropped");
            return Ok(());
        };

        let template = self
            .templates
            .job_steps(&job.job_type)
            .and_then(|steps| steps.iter().find(|t| &t.task_id == task_id));

        let patch = match event.phase {
            Phase::Running => StepPatch {
                state: Some(StepState::Running),
                message: template.and_then(|t| t.start_message.clone()),
                ..Default::default()
            },
            Phase::Succeeded => StepPatch {
                state: Some(StepState::Finished),
                progress: Some(100),
                message: template.and_then(|t| t.finish_message.clone()),
                ..Default::default()
            },
            Phase::Failed => StepPatch {
                state: Some(StepState::Failed),
                message: Some(sanitize_failure_message(
                    event.error.as_ref(),
                    template,
                    job.id,
                    event.phase,
                )),
                ..Default::default()
            },
            _ => return Ok(()),
        };

        self.lifecycle.set_step_details(job.id, task_id, &patch).await?;
        Ok(())
    }

    async fn resolve_job_id(&self, execution_id: &str) -> AppResult<Option<Uuid>> {
        Ok(self
            .engine
            .fetch_execution(execution_id)
            .await?
            .map(|e| e.annotations.job_id))
    }

    /// Ad-hoc step progress updates. A cancelled job's steps are frozen.
    pub async fn on_job_step_details(&self, payload: &[u8]) -> AppResult<()> {
        let update: StepDetailsUpdate = parse_message(payload)?;
        let Some(job_id) = self.resolve_job_id(&update.execution_id).await? else {
            tracing::warn!(execution = %update.execution_id, "Step update for unknown execution dropped");
            return Ok(());
        };
        let Some(job) = self.lifecycle.store().get(job_id).await? else {
            return Ok(());
        };
        if job.cancellation_info.is_cancelled {
            tracing::debug!(job_id = %job_id, "Step update for cancelled job dropped");
            return Ok(());
        }

        self.lifecycle
            .set_step_details(
                job_id,
                &update.task_id,
                &StepPatch {
                    state: update.state,
                    progress: update.progress,
                    message: update.message,
                    warning: update.warning,
                },
            )
            .await?;
        Ok(())
    }

    /// Metadata/cost/GPU side-channel.
    pub async fn on_job_update(&self, payload: &[u8]) -> AppResult<()> {
        let update: JobUpdate = parse_message(payload)?;
        let Some(job_id) = self.resolve_job_id(&update.execution_id).await? else {
            tracing::warn!(execution = %update.execution_id, "Job update for unknown execution dropped");
            return Ok(());
        };

        if let Some(metadata) = update.metadata {
            self.lifecycle.update_metadata(job_id, metadata).await?;
        }
        if let Some(records) = update.cost {
            self.lifecycle.update_cost_consumed(job_id, records).await?;
        }
        if let Some(gpu) = update.gpu {
            if gpu.state == GpuState::Released {
                self.lifecycle.set_gpu_released(job_id).await?;
            }
        }
        Ok(())
    }

    /// A project was deleted: every one of its jobs is cancelled and
    /// slated for physical deletion.
    pub async fn on_project_deleted(&self, payload: &[u8]) -> AppResult<()> {
        let notice: ProjectDeleted = parse_message(payload)?;
        self.lifecycle
            .mark_project_jobs_deleted(&notice.project_id)
            .await?;
        Ok(())
    }

    /// Terminal accounting consumer for finished/failed/cancelled notices.
    pub async fn on_job_terminal(&self, payload: &[u8]) -> AppResult<()> {
        let notice: TerminalNotice = parse_message(payload)?;
        self.cost.reconcile(notice.job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ResolvedExecution;
    use crate::error::AppError;
    use crate::model::{JobCost, JobState, ResourceRequest, StepDetail};
    use crate::services::cost::MeteringEvent;
    use crate::services::lifecycle::{JobOutcome, JobOutcomeEvent};
    use crate::services::templates::YamlTemplateRegistry;
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        outcomes: Arc<Mutex<Vec<JobOutcome>>>,
    }

    impl OutcomePublisher for RecordingPublisher {
        async fn publish_outcome(&self, outcome: JobOutcome, _: &JobOutcomeEvent) -> AppResult<()> {
            self.outcomes.lock().unwrap().push(outcome);
            Ok(())
        }

        async fn publish_acl_revoked(&self, _: Uuid) -> AppResult<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingMetering {
        events: Arc<Mutex<Vec<MeteringEvent>>>,
    }

    impl MeteringPublisher for RecordingMetering {
        async fn publish_metering(&self, event: &MeteringEvent) -> AppResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeCredits {
        cancelled: Arc<Mutex<Vec<String>>>,
    }

    impl CreditsClient for FakeCredits {
        async fn cancel_lease(&self, lease_id: &str) -> AppResult<()> {
            self.cancelled.lock().unwrap().push(lease_id.to_string());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeEngine {
        executions: HashMap<String, ExecutionAnnotations>,
        selections: HashMap<String, String>,
    }

    impl WorkflowEngine for FakeEngine {
        async fn fetch_execution(&self, name: &str) -> AppResult<Option<ResolvedExecution>> {
            Ok(self.executions.get(name).map(|annotations| ResolvedExecution {
                name: name.to_string(),
                annotations: annotations.clone(),
            }))
        }

        async fn branch_selections(&self, _: &str) -> AppResult<HashMap<String, String>> {
            Ok(self.selections.clone())
        }
    }

    const TEMPLATES: &str = r#"
train:
  - task_id: prepare
    name: Prepare dataset
    start_message: Collecting images
  - task_id: train
    name: Train model
    failure_message: "Training failed for job {job_id}"
  - task_id: pretrain
    name: Pretrain backbone
    branches:
      - condition: needs_pretrain
        branch: from_scratch
        skip_message: Reused pretrained weights
"#;

    type TestHandler = ProgressHandler<
        MemoryJobStore,
        RecordingPublisher,
        FakeEngine,
        YamlTemplateRegistry,
        RecordingMetering,
        FakeCredits,
    >;

    struct Fixture {
        handler: TestHandler,
        store: MemoryJobStore,
        publisher: RecordingPublisher,
        metering: RecordingMetering,
        job_id: Uuid,
    }

    fn annotations(job_id: Uuid, kind: ExecutionKind) -> ExecutionAnnotations {
        ExecutionAnnotations {
            organization_id: "org-1".to_string(),
            workspace_id: "ws-1".to_string(),
            job_id,
            execution_type: kind,
        }
    }

    /// A running "train" job whose main execution is known to the engine
    /// as `exec-main` and whose revert execution as `exec-revert`.
    async fn fixture() -> Fixture {
        let store = MemoryJobStore::new();
        let publisher = RecordingPublisher::default();
        let metering = RecordingMetering::default();
        let lifecycle = LifecycleService::new(store.clone(), publisher.clone());
        let cost = CostService::new(
            store.clone(),
            metering.clone(),
            FakeCredits::default(),
            "jobs",
        );

        let job = Job::new(Uuid::new_v4(), "train", "project-1", "workspace-1", json!({}));
        let job_id = job.id;
        lifecycle.submit(&job).await.unwrap();
        lifecycle.mark_ready_for_scheduling(job_id).await.unwrap();
        lifecycle.find_and_lock_for_scheduling().await.unwrap();
        let steps = vec![
            StepDetail::waiting("prepare", "Prepare dataset"),
            StepDetail::waiting("train", "Train model"),
            StepDetail::waiting("pretrain", "Pretrain backbone"),
        ];
        lifecycle
            .set_scheduled(job_id, "exec-main", None, steps)
            .await
            .unwrap();
        lifecycle.set_running(job_id).await.unwrap();

        let mut engine = FakeEngine::default();
        engine
            .executions
            .insert("exec-main".to_string(), annotations(job_id, ExecutionKind::Main));
        engine.executions.insert(
            "exec-revert".to_string(),
            annotations(job_id, ExecutionKind::Revert),
        );
        engine
            .selections
            .insert("needs_pretrain".to_string(), "pretrained".to_string());

        let templates = YamlTemplateRegistry::from_yaml(TEMPLATES).unwrap();
        Fixture {
            handler: ProgressHandler::new(lifecycle, cost, engine, templates),
            store,
            publisher,
            metering,
            job_id,
        }
    }

    fn workflow_body(execution: &str, phase: &str) -> Vec<u8> {
        json!({"event": {"executionId": {"name": execution}, "phase": phase}})
            .to_string()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_main_succeeded_finishes_job() {
        let f = fixture().await;
        f.handler
            .on_engine_event(
                crate::events::types::CE_WORKFLOW_EVENT,
                &workflow_body("exec-main", "SUCCEEDED"),
            )
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(
            f.publisher.outcomes.lock().unwrap().as_slice(),
            &[JobOutcome::Finished]
        );
    }

    #[tokio::test]
    async fn test_main_failure_routes_to_revert() {
        let f = fixture().await;
        f.handler
            .on_engine_event(
                crate::events::types::CE_WORKFLOW_EVENT,
                &workflow_body("exec-main", "ABORTED"),
            )
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::ReadyForRevert);
        assert!(f.publisher.outcomes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revert_outcome_depends_on_cancel_flag() {
        let f = fixture().await;
        // Cancelled job: revert success lands on Cancelled.
        f.handler
            .lifecycle
            .request_cancellation(f.job_id)
            .await
            .unwrap();
        f.handler.lifecycle.set_ready_for_revert(f.job_id).await.unwrap();

        f.handler
            .on_engine_event(
                crate::events::types::CE_WORKFLOW_EVENT,
                &workflow_body("exec-revert", "SUCCEEDED"),
            )
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(
            f.publisher.outcomes.lock().unwrap().as_slice(),
            &[JobOutcome::Cancelled]
        );
    }

    #[tokio::test]
    async fn test_revert_without_cancel_fails_job() {
        let f = fixture().await;
        f.handler.lifecycle.set_ready_for_revert(f.job_id).await.unwrap();

        f.handler
            .on_engine_event(
                crate::events::types::CE_WORKFLOW_EVENT,
                &workflow_body("exec-revert", "FAILED"),
            )
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_unknown_execution_dropped() {
        let f = fixture().await;
        f.handler
            .on_engine_event(
                crate::events::types::CE_WORKFLOW_EVENT,
                &workflow_body("exec-ghost", "SUCCEEDED"),
            )
            .await
            .unwrap();
        assert_eq!(
            f.store.get(f.job_id).await.unwrap().unwrap().state,
            JobState::Running
        );
    }

    #[tokio::test]
    async fn test_task_failure_oom_substitution() {
        let f = fixture().await;
        let body = json!({
            "event": {
                "executionId": {"name": "exec-main"},
                "phase": "FAILED",
                "taskId": "prepare",
                "parentNode": "n0",
                "error": {"code": "OOMKilled", "message": "killed"}
            }
        });
        f.handler
            .on_engine_event(crate::events::types::CE_TASK_EVENT, body.to_string().as_bytes())
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        let step = job.step("prepare").unwrap();
        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.message.as_deref(), Some(OOM_MESSAGE));
    }

    #[tokio::test]
    async fn test_task_failure_template_interpolation() {
        let f = fixture().await;
        let body = json!({
            "event": {
                "executionId": {"name": "exec-main"},
                "phase": "FAILED",
                "taskId": "train",
                "parentNode": "n1",
                "error": {"code": "UserError", "message": "bad loss"}
            }
        });
        f.handler
            .on_engine_event(crate::events::types::CE_TASK_EVENT, body.to_string().as_bytes())
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        let step = job.step("train").unwrap();
        assert_eq!(
            step.message.as_deref(),
            Some(format!("Training failed for job {}", f.job_id).as_str())
        );
    }

    #[tokio::test]
    async fn test_task_success_sets_full_progress() {
        let f = fixture().await;
        let body = json!({
            "event": {
                "executionId": {"name": "exec-main"},
                "phase": "SUCCEEDED",
                "taskId": "prepare",
                "parentNode": "n0"
            }
        });
        f.handler
            .on_engine_event(crate::events::types::CE_TASK_EVENT, body.to_string().as_bytes())
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        let step = job.step("prepare").unwrap();
        assert_eq!(step.state, StepState::Finished);
        assert_eq!(step.progress, Some(100));
    }

    #[tokio::test]
    async fn test_revert_task_events_ignored() {
        let f = fixture().await;
        let body = json!({
            "event": {
                "executionId": {"name": "exec-revert"},
                "phase": "RUNNING",
                "taskId": "prepare",
                "parentNode": "n0"
            }
        });
        f.handler
            .on_engine_event(crate::events::types::CE_TASK_EVENT, body.to_string().as_bytes())
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.step("prepare").unwrap().state, StepState::Waiting);
    }

    #[tokio::test]
    async fn test_branch_node_skips_untaken_step() {
        let f = fixture().await;
        let body = json!({
            "event": {
                "executionId": {"name": "exec-main"},
                "phase": "QUEUED",
                "nodeName": "needs_pretrain"
            }
        });
        f.handler
            .on_engine_event(crate::events::types::CE_NODE_EVENT, body.to_string().as_bytes())
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        let step = job.step("pretrain").unwrap();
        assert_eq!(step.state, StepState::Skipped);
        assert_eq!(step.message.as_deref(), Some("Reused pretrained weights"));
        // Unbranched steps are untouched.
        assert_eq!(job.step("train").unwrap().state, StepState::Waiting);
    }

    #[tokio::test]
    async fn test_step_updates_frozen_after_cancellation() {
        let f = fixture().await;
        let body = json!({
            "execution_id": "exec-main",
            "task_id": "prepare",
            "progress": 50
        });
        f.handler
            .on_job_step_details(body.to_string().as_bytes())
            .await
            .unwrap();
        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.step("prepare").unwrap().progress, Some(50));

        f.handler
            .lifecycle
            .request_cancellation(f.job_id)
            .await
            .unwrap();
        let body = json!({
            "execution_id": "exec-main",
            "task_id": "prepare",
            "progress": 80
        });
        f.handler
            .on_job_step_details(body.to_string().as_bytes())
            .await
            .unwrap();
        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.step("prepare").unwrap().progress, Some(50));
    }

    #[tokio::test]
    async fn test_job_update_side_channel() {
        let f = fixture().await;
        {
            let mut job = f.store.get(f.job_id).await.unwrap().unwrap();
            job.cost = Some(JobCost {
                requests: vec![ResourceRequest {
                    amount: 100,
                    unit: "images".to_string(),
                }],
                ..Default::default()
            });
            f.store.delete(f.job_id).await.unwrap();
            f.store.insert(&job).await.unwrap();
        }

        let body = json!({
            "execution_id": "exec-main",
            "metadata": {"model": "yolo"},
            "cost": [
                {"amount": 10, "unit": "images", "consuming_date": "2026-08-27T10:00:00Z", "service": "training"},
                {"amount": 5, "unit": "frames", "consuming_date": "2026-08-27T10:00:00Z", "service": "training"}
            ]
        });
        f.handler.on_job_update(body.to_string().as_bytes()).await.unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert_eq!(job.metadata.get("model"), Some(&json!("yolo")));
        let cost = job.cost.unwrap();
        // Unrequested units are dropped.
        assert_eq!(cost.consumed.len(), 1);
        assert_eq!(cost.consumed[0].unit, "images");
    }

    #[tokio::test]
    async fn test_project_deleted_marks_jobs() {
        let f = fixture().await;
        let body = json!({"project_id": "project-1"});
        f.handler
            .on_project_deleted(body.to_string().as_bytes())
            .await
            .unwrap();

        let job = f.store.get(f.job_id).await.unwrap().unwrap();
        assert!(job.cancellation_info.is_cancelled);
        assert!(job.cancellation_info.delete_job);
    }

    #[tokio::test]
    async fn test_terminal_notice_reconciles_cost() {
        let f = fixture().await;
        {
            let mut job = f.store.get(f.job_id).await.unwrap().unwrap();
            job.cost = Some(JobCost {
                requests: vec![ResourceRequest {
                    amount: 100,
                    unit: "images".to_string(),
                }],
                lease_id: Some("lease-1".to_string()),
                consumed: vec![crate::model::ConsumedResource {
                    amount: 10,
                    unit: "images".to_string(),
                    consuming_date: chrono::Utc::now(),
                    service: "training".to_string(),
                }],
                reported: false,
            });
            f.store.delete(f.job_id).await.unwrap();
            f.store.insert(&job).await.unwrap();
        }

        let body = json!({"job_id": f.job_id});
        f.handler.on_job_terminal(body.to_string().as_bytes()).await.unwrap();
        f.handler.on_job_terminal(body.to_string().as_bytes()).await.unwrap();

        assert_eq!(f.metering.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_notice_for_missing_job_raises() {
        let f = fixture().await;
        let body = json!({"job_id": Uuid::new_v4()});
        let result = f.handler.on_job_terminal(body.to_string().as_bytes()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
