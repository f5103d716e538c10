//! Retrying client and the bounded submission pool.

use crate::api::SandboxApi;
use crate::types::{HealthReport, SandboxError, ValidateRequest, ValidateResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// A verdict together with how many retries it cost.
#[derive(Debug, Clone)]
pub struct ValidateOutcome {
    pub response: ValidateResponse,
    pub retries: u32,
}

/// Wraps a `SandboxApi` with the retry policy: up to `max_retries` extra
/// attempts for retryable failures, exponential backoff (doubling from
/// `initial_backoff`), and `Retry-After` honored on queue-full.
pub struct SandboxClient {
    api: Arc<dyn SandboxApi>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl SandboxClient {
    pub fn new(api: Arc<dyn SandboxApi>, max_retries: u32) -> Self {
        Self { api, max_retries, initial_backoff: Duration::from_secs(1) }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub async fn health(&self) -> Result<HealthReport, SandboxError> {
        self.api.health().await
    }

    /// True when the service reports a healthy status with the given
    /// readiness requirements.
    pub async fn is_healthy(&self, require_token: bool, require_sandbox: bool) -> bool {
        match self.api.health().await {
            Ok(report) => report.is_ready(require_token, require_sandbox),
            Err(e) => {
                warn!("validation api health check failed: {e}");
                false
            }
        }
    }

    pub async fn validate(
        &self,
        request: &ValidateRequest,
    ) -> Result<ValidateOutcome, SandboxError> {
        let mut backoff = self.initial_backoff;
        let mut last_error: Option<SandboxError> = None;

        for attempt in 0..=self.max_retries {
            match self.api.submit(request).await {
                Ok(response) => {
                    info!(
                        job_id = %response.job_id,
                        score = response.result.score,
                        attempt = attempt + 1,
                        "validation job scored"
                    );
                    return Ok(ValidateOutcome { response, retries: attempt });
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = match &e {
                        SandboxError::QueueFull { retry_after_s } => {
                            Duration::from_secs(*retry_after_s)
                        }
                        _ => backoff,
                    };
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries + 1,
                        delay_s = delay.as_secs_f64(),
                        "validation attempt failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                    last_error = Some(e);
                }
                Err(e) => {
                    // Non-retryable, or the budget is spent.
                    if attempt >= self.max_retries && e.is_retryable() {
                        return Err(SandboxError::RetriesExhausted {
                            attempts: attempt + 1,
                            last: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            }
        }
        // Loop always returns; this covers max_retries wrap-around only.
        Err(SandboxError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

/// Bounds concurrent submissions. The bundled sandbox instance is only
/// reliable up to 4 concurrent jobs, so the pool size is capped there no
/// matter what the configuration asks for.
pub struct SandboxPool {
    client: Arc<SandboxClient>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl SandboxPool {
    pub const MAX_CONCURRENCY: usize = 4;

    pub fn new(client: Arc<SandboxClient>, concurrency: usize) -> Self {
        let size = concurrency.clamp(1, Self::MAX_CONCURRENCY);
        Self { client, permits: Arc::new(Semaphore::new(size)), size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn is_healthy(&self, require_token: bool, require_sandbox: bool) -> bool {
        self.client.is_healthy(require_token, require_sandbox).await
    }

    pub async fn health(&self) -> Result<HealthReport, SandboxError> {
        self.client.health().await
    }

    /// Submit under a pool permit. Waits when the pool is saturated.
    pub async fn validate(
        &self,
        request: &ValidateRequest,
    ) -> Result<ValidateOutcome, SandboxError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SandboxError::Transport("pool closed".to_string()))?;
        self.client.validate(request).await
    }
}
