//! Cost/metering reconciliation at job terminal transitions.
//!
//! Jobs that consumed resources produce one metering event; jobs that held
//! a lease but never drew on it get the lease cancelled instead. Either
//! way `cost.reported` flips through a conditional update, so a redelivered
//! terminal event settles nothing twice.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::CreditsClient;
use crate::error::{AppError, AppResult};
use crate::model::Job;
use crate::store::{JobFilter, JobMutation, JobStore};

/// One consumed amount in a metering event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionEntry {
    pub amount: i64,
    pub unit: String,
}

/// Billing record published for a job that consumed resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringEvent {
    pub service_name: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    pub consumption: Vec<ConsumptionEntry>,
    /// Report time in epoch milliseconds; consumption dates are normalized
    /// to it.
    pub date_ms: i64,
}

impl MeteringEvent {
    fn from_job(job: &Job, service_name: &str) -> Self {
        let cost = job.cost.as_ref();
        Self {
            service_name: service_name.to_string(),
            project_id: job.project_id.clone(),
            lease_id: cost.and_then(|c| c.lease_id.clone()),
            consumption: cost
                .map(|c| {
                    c.consumed
                        .iter()
                        .map(|r| ConsumptionEntry {
                            amount: r.amount,
                            unit: r.unit.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            date_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Metering-event sink.
pub trait MeteringPublisher: Send + Sync {
    fn publish_metering(
        &self,
        event: &MeteringEvent,
    ) -> impl std::future::Future<Output = AppResult<()>> + Send;
}

/// Terminal-accounting service.
#[derive(Clone)]
pub struct CostService<S, P, C> {
    store: S,
    publisher: P,
    credits: C,
    service_name: String,
}

impl<S: JobStore + Clone, P: MeteringPublisher, C: CreditsClient> CostService<S, P, C> {
    pub fn new(store: S, publisher: P, credits: C, service_name: &str) -> Self {
        Self {
            store,
            publisher,
            credits,
            service_name: service_name.to_string(),
        }
    }

    /// Settle the cost of a terminal job.
    ///
    /// A missing job here is a consistency bug, not a droppable event, and
    /// is raised as [`AppError::NotFound`].
    pub async fn reconcile(&self, job_id: Uuid) -> AppResult<()> {
        let Some(job) = self.store.get(job_id).await? else {
            return Err(AppError::NotFound(format!(
                "Job missing at terminal accounting: {}",
                job_id
            )));
        };

        let Some(cost) = &job.cost else {
            return Ok(());
        };
        if cost.reported {
            return Ok(());
        }

        if !cost.consumed.is_empty() {
            // Claim the report first; a lost race means another consumer
            // already metered this job.
            if !self.claim_report(job_id).await? {
                return Ok(());
            }
            let event = MeteringEvent::from_job(&job, &self.service_name);
            self.publisher.publish_metering(&event).await?;
            tracing::info!(job_id = %job_id, records = event.consumption.len(), "Metering event published");
        } else {
            // Nothing was drawn on the reservation: compensate by
            // cancelling the lease. Cancellation is idempotent, so do it
            // before claiming the report flag.
            if let Some(lease_id) = &cost.lease_id {
                self.credits.cancel_lease(lease_id).await?;
                tracing::info!(job_id = %job_id, lease_id = %lease_id, "Unused lease cancelled");
            }
            self.claim_report(job_id).await?;
        }

        Ok(())
    }

    async fn claim_report(&self, job_id: Uuid) -> AppResult<bool> {
        self.store
            .update_if(
                job_id,
                &JobFilter::new().cost_settled(false),
                &[JobMutation::SetCostReported],
            )
            .await
    }
}
