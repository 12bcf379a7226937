//! JetStream consumer loop.
//!
//! One durable pull consumer over every consumed subject, dispatched to
//! the progress handler. Malformed messages are acked away; handler
//! failures are nacked so the bus redelivers them.

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, Context};
use futures::StreamExt;

use crate::clients::{CreditsClient, WorkflowEngine};
use crate::error::{AppError, AppResult};
use crate::events::progress::ProgressHandler;
use crate::events::types::CE_TYPE_HEADER;
use crate::nats::{
    ensure_stream, STREAM_NAME, SUBJECT_ENGINE_EVENTS, SUBJECT_JOB_CANCELLED, SUBJECT_JOB_FAILED,
    SUBJECT_JOB_FINISHED, SUBJECT_JOB_STEPS, SUBJECT_JOB_UPDATE, SUBJECT_PROJECTS_DELETED,
};
use crate::services::cost::MeteringPublisher;
use crate::services::lifecycle::OutcomePublisher;
use crate::services::templates::StepTemplateRegistry;
use crate::store::JobStore;

const CONSUMER_NAME: &str = "job-plane";

/// Durable JetStream subscriber for the job-plane subjects.
pub struct NatsSubscriber {
    js: Context,
}

impl NatsSubscriber {
    pub async fn new(client: async_nats::Client) -> AppResult<Self> {
        let js = jetstream::new(client);
        ensure_stream(&js).await?;
        Ok(Self { js })
    }

    async fn ensure_consumer(
        &self,
    ) -> AppResult<jetstream::consumer::Consumer<ConsumerConfig>> {
        let stream = self
            .js
            .get_stream(STREAM_NAME)
            .await
            .map_err(|e| AppError::Nats(format!("Stream lookup failed: {}", e)))?;

        let config = ConsumerConfig {
            durable_name: Some(CONSUMER_NAME.to_string()),
            filter_subjects: vec![
                SUBJECT_ENGINE_EVENTS.to_string(),
                SUBJECT_JOB_STEPS.to_string(),
                SUBJECT_JOB_UPDATE.to_string(),
                SUBJECT_PROJECTS_DELETED.to_string(),
                SUBJECT_JOB_FINISHED.to_string(),
                SUBJECT_JOB_FAILED.to_string(),
                SUBJECT_JOB_CANCELLED.to_string(),
            ],
            ..Default::default()
        };

        match stream.get_consumer(CONSUMER_NAME).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => {
                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| AppError::Nats(format!("Consumer setup failed: {}", e)))?;
                tracing::info!(consumer = %CONSUMER_NAME, "Created NATS consumer");
                Ok(consumer)
            }
        }
    }

    /// Consume messages until the stream ends or the process shuts down.
    pub async fn run<S, P, W, T, M, C>(
        &self,
        handler: &ProgressHandler<S, P, W, T, M, C>,
    ) -> AppResult<()>
    where
        S: JobStore + Clone,
        P: OutcomePublisher,
        W: WorkflowEngine,
        T: StepTemplateRegistry,
        M: MeteringPublisher,
        C: CreditsClient,
    {
        let consumer = self.ensure_consumer().await?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| AppError::Nats(format!("Message stream failed: {}", e)))?;

        tracing::info!("Consumer loop started");
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "Message receive failed");
                    continue;
                }
            };

            match dispatch(handler, &message).await {
                Ok(()) => {
                    if let Err(e) = message.ack().await {
                        tracing::error!(error = %e, "Message ack failed");
                    }
                }
                Err(e) if e.is_parse() => {
                    // Malformed input never gets better on redelivery.
                    tracing::warn!(subject = %message.subject, error = %e, "Dropped malformed message");
                    if let Err(e) = message.ack().await {
                        tracing::error!(error = %e, "Message ack failed");
                    }
                }
                Err(e) => {
                    tracing::error!(subject = %message.subject, error = %e, "Message handling failed");
                    if let Err(e) = message
                        .ack_with(jetstream::AckKind::Nak(None))
                        .await
                    {
                        tracing::error!(error = %e, "Message nack failed");
                    }
                }
            }
        }

        tracing::warn!("Consumer loop ended");
        Ok(())
    }
}

async fn dispatch<S, P, W, T, M, C>(
    handler: &ProgressHandler<S, P, W, T, M, C>,
    message: &jetstream::Message,
) -> AppResult<()>
where
    S: JobStore + Clone,
    P: OutcomePublisher,
    W: WorkflowEngine,
    T: StepTemplateRegistry,
    M: MeteringPublisher,
    C: CreditsClient,
{
    match message.subject.as_str() {
        SUBJECT_ENGINE_EVENTS => {
            let ce_type = message
                .headers
                .as_ref()
                .and_then(|headers| headers.get(CE_TYPE_HEADER))
                .map(|value| value.as_str().to_string())
                .ok_or_else(|| AppError::Parse("Missing ce_type header".to_string()))?;
            handler.on_engine_event(&ce_type, &message.payload).await
        }
        SUBJECT_JOB_STEPS => handler.on_job_step_details(&message.payload).await,
        SUBJECT_JOB_UPDATE => handler.on_job_update(&message.payload).await,
        SUBJECT_PROJECTS_DELETED => handler.on_project_deleted(&message.payload).await,
        SUBJECT_JOB_FINISHED | SUBJECT_JOB_FAILED | SUBJECT_JOB_CANCELLED => {
            handler.on_job_terminal(&message.payload).await
        }
        other => Err(AppError::Parse(format!("Unexpected subject: {}", other))),
    }
}
