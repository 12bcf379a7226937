//! NATS JetStream wiring: subjects, stream setup, publisher, consumer loop.

pub mod publisher;
pub mod subscriber;

pub use publisher::NatsPublisher;
pub use subscriber::NatsSubscriber;

use async_nats::jetstream::{self, Context};

use crate::error::{AppError, AppResult};
use crate::services::lifecycle::JobOutcome;

/// JetStream stream holding every job-plane subject.
pub const STREAM_NAME: &str = "jobplane";

/// Engine event stream (Flyte-style `*EventRequest` messages).
pub const SUBJECT_ENGINE_EVENTS: &str = "jobs.engine.events";
/// Ad-hoc step progress updates.
pub const SUBJECT_JOB_STEPS: &str = "jobs.steps";
/// Metadata/cost/GPU side-channel updates.
pub const SUBJECT_JOB_UPDATE: &str = "jobs.update";
/// Project deletion notices.
pub const SUBJECT_PROJECTS_DELETED: &str = "projects.deleted";
/// Terminal outcome events; published here and consumed back for
/// cost accounting.
pub const SUBJECT_JOB_FINISHED: &str = "jobs.finished";
pub const SUBJECT_JOB_FAILED: &str = "jobs.failed";
pub const SUBJECT_JOB_CANCELLED: &str = "jobs.cancelled";
/// Access-control revocation notices for deleted jobs.
pub const SUBJECT_ACL_REVOKE: &str = "jobs.acl.revoke";
/// Metering/billing records.
pub const SUBJECT_METERING: &str = "credits.lease";

/// Subject a terminal outcome is published to.
pub fn outcome_subject(outcome: JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Finished => SUBJECT_JOB_FINISHED,
        JobOutcome::Failed => SUBJECT_JOB_FAILED,
        JobOutcome::Cancelled => SUBJECT_JOB_CANCELLED,
    }
}

/// Connect to the NATS server.
pub async fn connect(nats_url: &str) -> AppResult<async_nats::Client> {
    let client = async_nats::connect(nats_url)
        .await
        .map_err(|e| AppError::Nats(format!("Connection failed: {}", e)))?;
    tracing::info!(url = %nats_url, "Connected to NATS");
    Ok(client)
}

/// Ensure the job-plane stream exists.
pub(crate) async fn ensure_stream(js: &Context) -> AppResult<()> {
    match js.get_stream(STREAM_NAME).await {
        Ok(_) => {
            tracing::debug!(stream = %STREAM_NAME, "Using existing NATS stream");
            Ok(())
        }
        Err(_) => {
            let config = jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: vec![
                    SUBJECT_ENGINE_EVENTS.to_string(),
                    SUBJECT_JOB_STEPS.to_string(),
                    SUBJECT_JOB_UPDATE.to_string(),
                    SUBJECT_PROJECTS_DELETED.to_string(),
                    SUBJECT_JOB_FINISHED.to_string(),
                    SUBJECT_JOB_FAILED.to_string(),
                    SUBJECT_JOB_CANCELLED.to_string(),
                    SUBJECT_ACL_REVOKE.to_string(),
                    SUBJECT_METERING.to_string(),
                ],
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            };
            js.create_stream(config)
                .await
                .map_err(|e| AppError::Nats(format!("Stream setup failed: {}", e)))?;
            tracing::info!(stream = %STREAM_NAME, "Created NATS stream");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_subjects() {
        assert_eq!(outcome_subject(JobOutcome::Finished), "jobs.finished");
        assert_eq!(outcome_subject(JobOutcome::Failed), "jobs.failed");
        assert_eq!(outcome_subject(JobOutcome::Cancelled), "jobs.cancelled");
    }
}
