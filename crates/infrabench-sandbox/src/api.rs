//! Single-attempt API surface: one trait, an HTTP implementation, and a
//! scripted mock for tests.

use crate::types::{HealthReport, SandboxError, ValidateRequest, ValidateResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// One attempt against the validation service. Retry policy is layered on
/// top by `SandboxClient`.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    async fn health(&self) -> Result<HealthReport, SandboxError>;
    async fn submit(&self, request: &ValidateRequest) -> Result<ValidateResponse, SandboxError>;
}

// ============================================================
// HTTP implementation
// ============================================================

pub struct HttpSandboxApi {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSandboxApi {
    /// `endpoint` is the service base URL, e.g. `http://127.0.0.1:8888`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.trim_end_matches('/').to_string() })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_send_error(e: reqwest::Error) -> SandboxError {
        if e.is_timeout() {
            SandboxError::Timeout
        } else {
            SandboxError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl SandboxApi for HttpSandboxApi {
    async fn health(&self) -> Result<HealthReport, SandboxError> {
        let url = format!("{}/health", self.endpoint);
        let response = self.client.get(&url).send().await.map_err(Self::map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SandboxError::Status(status.as_u16()));
        }
        response
            .json::<HealthReport>()
            .await
            .map_err(|e| SandboxError::Decode(e.to_string()))
    }

    async fn submit(&self, request: &ValidateRequest) -> Result<ValidateResponse, SandboxError> {
        let url = format!("{}/validate", self.endpoint);
        debug!(%url, zip = %request.workspace_zip_path, "submitting validation job");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        match response.status().as_u16() {
            200 => response
                .json::<ValidateResponse>()
                .await
                .map_err(|e| SandboxError::Decode(e.to_string())),
            429 => {
                let retry_after_s = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                Err(SandboxError::QueueFull { retry_after_s })
            }
            503 => Err(SandboxError::Unavailable),
            other => Err(SandboxError::Status(other)),
        }
    }
}

// ============================================================
// Scripted mock
// ============================================================

enum Scripted {
    Ok(ValidateResponse),
    Err(SandboxError),
}

type SubmitHandler =
    Box<dyn Fn(&ValidateRequest) -> Result<ValidateResponse, SandboxError> + Send + Sync>;

/// Mock service that plays back a queue of scripted outcomes. When the
/// queue is exhausted it keeps returning the final `fallback` response.
/// A handler closure, when set, takes precedence over the script and can
/// score each request by content (e.g. by `task_json.miner_uid`).
#[derive(Default)]
pub struct MockSandboxApi {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Option<ValidateResponse>>,
    handler: Mutex<Option<SubmitHandler>>,
    healthy: Mutex<bool>,
    submissions: Mutex<u64>,
    health_checks: Mutex<u64>,
}

impl MockSandboxApi {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            handler: Mutex::new(None),
            healthy: Mutex::new(true),
            submissions: Mutex::new(0),
            health_checks: Mutex::new(0),
        }
    }

    pub fn scored(score: f64) -> ValidateResponse {
        ValidateResponse {
            job_id: "job-mock".to_string(),
            result: crate::types::Verdict {
                status: if score > 0.0 { "pass" } else { "fail" }.to_string(),
                score,
                msg: String::new(),
            },
            ..Default::default()
        }
    }

    pub fn push_ok(&self, response: ValidateResponse) {
        self.script.lock().push_back(Scripted::Ok(response));
    }

    pub fn push_err(&self, error: SandboxError) {
        self.script.lock().push_back(Scripted::Err(error));
    }

    pub fn set_fallback(&self, response: ValidateResponse) {
        *self.fallback.lock() = Some(response);
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&ValidateRequest) -> Result<ValidateResponse, SandboxError> + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    pub fn submission_count(&self) -> u64 {
        *self.submissions.lock()
    }

    pub fn health_check_count(&self) -> u64 {
        *self.health_checks.lock()
    }
}

#[async_trait]
impl SandboxApi for MockSandboxApi {
    async fn health(&self) -> Result<HealthReport, SandboxError> {
        *self.health_checks.lock() += 1;
        if *self.healthy.lock() {
            Ok(HealthReport {
                status: "ok".to_string(),
                token_ready: true,
                sandbox_ready: true,
                token_error: None,
            })
        } else {
            Ok(HealthReport { status: "down".to_string(), ..Default::default() })
        }
    }

    async fn submit(&self, request: &ValidateRequest) -> Result<ValidateResponse, SandboxError> {
        *self.submissions.lock() += 1;
        if let Some(handler) = self.handler.lock().as_ref() {
            return handler(request);
        }
        match self.script.lock().pop_front() {
            Some(Scripted::Ok(response)) => Ok(response),
            Some(Scripted::Err(error)) => Err(error),
            None => match self.fallback.lock().clone() {
                Some(response) => Ok(response),
                None => Err(SandboxError::Status(500)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ValidateRequest {
        ValidateRequest {
            workspace_zip_path: "/tmp/ws.zip".to_string(),
            task_json: json!({"task_id": "t", "invariants": []}),
            timeout_s: 60,
            net_checks: false,
            stream_log: false,
            quiet_kernel: true,
        }
    }

    #[tokio::test]
    async fn test_mock_plays_script_then_fallback() {
        let mock = MockSandboxApi::new();
        mock.push_err(SandboxError::Unavailable);
        mock.push_ok(MockSandboxApi::scored(0.7));
        mock.set_fallback(MockSandboxApi::scored(1.0));

        assert!(mock.submit(&request()).await.is_err());
        assert_eq!(mock.submit(&request()).await.unwrap().result.score, 0.7);
        assert_eq!(mock.submit(&request()).await.unwrap().result.score, 1.0);
        assert_eq!(mock.submission_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_health_toggles() {
        let mock = MockSandboxApi::new();
        assert!(mock.health().await.unwrap().is_ready(true, true));
        mock.set_healthy(false);
        assert!(!mock.health().await.unwrap().is_ready(false, false));
        assert_eq!(mock.health_check_count(), 2);
    }
}
