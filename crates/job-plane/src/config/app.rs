//! Application configuration for the job lifecycle control plane.

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `JOBPLANE_`:
/// - `JOBPLANE_NATS_URL`: NATS server URL (default: "nats://localhost:4222")
/// - `JOBPLANE_ENGINE_URL`: Workflow engine admin API URL
/// - `JOBPLANE_CREDITS_URL`: Credit system API URL
/// - `JOBPLANE_TEMPLATES_PATH`: Path to the step template YAML file
/// - `JOBPLANE_SWEEP_INTERVAL`: Lock recovery sweep interval in seconds
/// - `JOBPLANE_SCHEDULING_LOCK_TIMEOUT`: Seconds a scheduling lock may be held
/// - `JOBPLANE_CANCELING_LOCK_TIMEOUT`: Seconds a canceling lock may be held
/// - `JOBPLANE_REVERT_LOCK_TIMEOUT`: Seconds a revert-scheduling lock may be held
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Workflow engine admin API URL
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Credit system API URL
    #[serde(default = "default_credits_url")]
    pub credits_url: String,

    /// Path to the step template YAML file
    #[serde(default = "default_templates_path")]
    pub templates_path: String,

    /// Service name reported in metering events
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Lock recovery sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Seconds a scheduling lock may be held before recovery
    #[serde(default = "default_lock_timeout")]
    pub scheduling_lock_timeout: u64,

    /// Seconds a canceling lock may be held before recovery
    #[serde(default = "default_lock_timeout")]
    pub canceling_lock_timeout: u64,

    /// Seconds a revert-scheduling lock may be held before recovery
    #[serde(default = "default_lock_timeout")]
    pub revert_lock_timeout: u64,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_engine_url() -> String {
    "http://localhost:8089".to_string()
}

fn default_credits_url() -> String {
    "http://localhost:8091".to_string()
}

fn default_templates_path() -> String {
    "job_steps.yaml".to_string()
}

fn default_service_name() -> String {
    "jobs".to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_lock_timeout() -> u64 {
    300
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `JOBPLANE_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("JOBPLANE_").from_env::<AppConfig>()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            engine_url: default_engine_url(),
            credits_url: default_credits_url(),
            templates_path: default_templates_path(),
            service_name: default_service_name(),
            sweep_interval: default_sweep_interval(),
            scheduling_lock_timeout: default_lock_timeout(),
            canceling_lock_timeout: default_lock_timeout(),
            revert_lock_timeout: default_lock_timeout(),
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.sweep_interval, 30);
        assert_eq!(config.scheduling_lock_timeout, 300);
        assert!(!config.debug);
    }
}
