//! JetStream publisher for job-plane side effects.

use async_nats::jetstream::{self, Context};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::nats::{ensure_stream, outcome_subject, SUBJECT_ACL_REVOKE, SUBJECT_METERING};
use crate::services::cost::{MeteringEvent, MeteringPublisher};
use crate::services::lifecycle::{JobOutcome, JobOutcomeEvent, OutcomePublisher};

/// NATS-backed implementation of the outcome and metering sinks.
#[derive(Clone)]
pub struct NatsPublisher {
    js: Context,
}

impl NatsPublisher {
    pub async fn new(client: async_nats::Client) -> AppResult<Self> {
        let js = jetstream::new(client);
        ensure_stream(&js).await?;
        Ok(Self { js })
    }

    async fn publish_json<T: Serialize>(&self, subject: &'static str, body: &T) -> AppResult<()> {
        let payload = serde_json::to_vec(body)?;
        self.js
            .publish(subject, payload.into())
            .await
            .map_err(|e| AppError::Nats(format!("Publish failed: {}", e)))?
            // Wait for the JetStream ack so a lost write surfaces here.
            .await
            .map_err(|e| AppError::Nats(format!("Publish not acknowledged: {}", e)))?;
        Ok(())
    }
}

impl OutcomePublisher for NatsPublisher {
    async fn publish_outcome(&self, outcome: JobOutcome, event: &JobOutcomeEvent) -> AppResult<()> {
        let subject = outcome_subject(outcome);
        self.publish_json(subject, event).await?;
        tracing::debug!(job_id = %event.job_id, subject = %subject, "Published job outcome");
        Ok(())
    }

    async fn publish_acl_revoked(&self, job_id: Uuid) -> AppResult<()> {
        self.publish_json(SUBJECT_ACL_REVOKE, &serde_json::json!({ "job_id": job_id }))
            .await?;
        tracing::debug!(job_id = %job_id, "Published ACL revocation");
        Ok(())
    }
}

impl MeteringPublisher for NatsPublisher {
    async fn publish_metering(&self, event: &MeteringEvent) -> AppResult<()> {
        self.publish_json(SUBJECT_METERING, event).await?;
        tracing::debug!(project_id = %event.project_id, "Published metering event");
        Ok(())
    }
}
