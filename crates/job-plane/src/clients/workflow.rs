//! Workflow-engine collaborator.
//!
//! Engine events only carry an execution name; the annotations on the
//! resolved execution tell us which job (and which of its two executions)
//! the event belongs to.

use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::ExecutionKind;

/// Annotations attached to an engine execution at launch time.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionAnnotations {
    pub organization_id: String,
    pub workspace_id: String,
    pub job_id: Uuid,
    pub execution_type: ExecutionKind,
}

/// An engine execution resolved by name.
#[derive(Debug, Clone)]
pub struct ResolvedExecution {
    pub name: String,
    pub annotations: ExecutionAnnotations,
}

/// Read-side contract against the workflow engine.
pub trait WorkflowEngine: Send + Sync {
    /// Resolve an execution by name; `None` when the engine does not know it.
    fn fetch_execution(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = AppResult<Option<ResolvedExecution>>> + Send;

    /// Branch decisions taken so far in an execution: branch-node name to
    /// the name of the branch that was selected.
    fn branch_selections(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = AppResult<HashMap<String, String>>> + Send;
}

#[derive(Debug, Deserialize)]
struct ExecutionMetadata {
    annotations: ExecutionAnnotations,
}

#[derive(Debug, Deserialize)]
struct ExecutionResponse {
    metadata: ExecutionMetadata,
}

#[derive(Debug, Deserialize)]
struct BranchesResponse {
    #[serde(default)]
    selections: HashMap<String, String>,
}

/// Flyte admin client over HTTP.
#[derive(Clone)]
pub struct FlyteClient {
    client: reqwest::Client,
    base_url: String,
}

impl FlyteClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl WorkflowEngine for FlyteClient {
    async fn fetch_execution(&self, name: &str) -> AppResult<Option<ResolvedExecution>> {
        let url = format!("{}/api/v1/executions/{}", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Engine request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "Engine returned {} for execution {}",
                response.status(),
                name
            )));
        }

        let body: ExecutionResponse = response
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("Invalid execution response: {}", e)))?;

        Ok(Some(ResolvedExecution {
            name: name.to_string(),
            annotations: body.metadata.annotations,
        }))
    }

    async fn branch_selections(&self, name: &str) -> AppResult<HashMap<String, String>> {
        let url = format!("{}/api/v1/executions/{}/branches", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Engine request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "Engine returned {} for branches of {}",
                response.status(),
                name
            )));
        }

        let body: BranchesResponse = response
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("Invalid branches response: {}", e)))?;
        Ok(body.selections)
    }
}
