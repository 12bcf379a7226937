//! Credit-system collaborator.

use crate::error::{AppError, AppResult};

/// Write-side contract against the credit system.
pub trait CreditsClient: Send + Sync {
    /// Cancel a resource lease that was reserved but never drawn upon.
    /// Cancelling an already-gone lease is not an error.
    fn cancel_lease(
        &self,
        lease_id: &str,
    ) -> impl std::future::Future<Output = AppResult<()>> + Send;
}

/// Credit-system client over HTTP.
#[derive(Clone)]
pub struct HttpCreditsClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCreditsClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl CreditsClient for HttpCreditsClient {
    async fn cancel_lease(&self, lease_id: &str) -> AppResult<()> {
        let url = format!("{}/api/v1/leases/{}", self.base_url, lease_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Credits request failed: {}", e)))?;

        // The lease may have expired on its own.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(lease_id = %lease_id, "Lease already gone");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "Credits returned {} cancelling lease {}",
                response.status(),
                lease_id
            )));
        }
        Ok(())
    }
}
