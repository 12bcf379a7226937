//! Job-type step templates.
//!
//! Each job type ships an ordered step plan: the step names shown to users,
//! per-step messages, and the conditional branches the workflow may take.
//! Templates are loaded once at startup from a YAML file keyed by job type.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::model::{StepBranch, StepDetail};

/// One step of a job type's execution plan, as declared in the template file.
#[derive(Debug, Clone, Deserialize)]
pub struct StepTemplate {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub branches: Vec<StepBranch>,
    #[serde(default)]
    pub start_message: Option<String>,
    #[serde(default)]
    pub finish_message: Option<String>,
    /// May contain a `{job_id}` placeholder.
    #[serde(default)]
    pub failure_message: Option<String>,
}

/// Lookup of step plans by job type.
pub trait StepTemplateRegistry: Send + Sync {
    fn job_steps(&self, job_type: &str) -> Option<&[StepTemplate]>;
}

/// Registry backed by a YAML file: a map of job type to step list.
#[derive(Debug, Clone, Default)]
pub struct YamlTemplateRegistry {
    templates: HashMap<String, Vec<StepTemplate>>,
}

impl YamlTemplateRegistry {
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::Config(format!(
                "Cannot read template file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let templates: HashMap<String, Vec<StepTemplate>> = serde_yaml::from_str(raw)?;
        for (job_type, steps) in &templates {
            let mut seen = std::collections::HashSet::new();
            for step in steps {
                if !seen.insert(step.task_id.as_str()) {
                    return Err(AppError::Config(format!(
                        "Duplicate task_id '{}' in template '{}'",
                        step.task_id, job_type
                    )));
                }
            }
        }
        Ok(Self { templates })
    }
}

impl StepTemplateRegistry for YamlTemplateRegistry {
    fn job_steps(&self, job_type: &str) -> Option<&[StepTemplate]> {
        self.templates.get(job_type).map(|steps| steps.as_slice())
    }
}

/// Materialize a step plan from templates: all steps start in `Waiting`.
pub fn to_step_details(templates: &[StepTemplate]) -> Vec<StepDetail> {
    templates
        .iter()
        .map(|t| {
            let mut step = StepDetail::waiting(&t.task_id, &t.name);
            step.branches = t.branches.clone();
            step
        })
        .collect()
}
