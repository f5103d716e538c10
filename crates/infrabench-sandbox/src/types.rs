//! Wire types for the validation service.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("validation api unreachable: {0}")]
    Transport(String),
    #[error("validation api request timed out")]
    Timeout,
    #[error("validation queue full (retry after {retry_after_s}s)")]
    QueueFull { retry_after_s: u64 },
    #[error("validation api unavailable (503)")]
    Unavailable,
    #[error("validation api returned HTTP {0}")]
    Status(u16),
    #[error("validation api reply decode failed: {0}")]
    Decode(String),
    #[error("validation api unhealthy")]
    Unhealthy,
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl SandboxError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::Transport(_)
                | SandboxError::Timeout
                | SandboxError::QueueFull { .. }
                | SandboxError::Unavailable
        )
    }
}

/// `GET /health` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub token_ready: bool,
    #[serde(default)]
    pub sandbox_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_error: Option<String>,
}

impl HealthReport {
    pub fn status_ok(&self) -> bool {
        matches!(self.status.trim().to_ascii_lowercase().as_str(), "ok" | "healthy")
    }

    /// Ready for submissions given the configured strictness.
    pub fn is_ready(&self, require_token: bool, require_sandbox: bool) -> bool {
        self.status_ok()
            && (!require_token || self.token_ready)
            && (!require_sandbox || self.sandbox_ready)
    }
}

/// `POST /validate` body. The zip is referenced by a server-readable path
/// (shared filesystem), not inlined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub workspace_zip_path: String,
    /// Canonical task document with top-level invariants.
    pub task_json: Value,
    pub timeout_s: u64,
    pub net_checks: bool,
    pub stream_log: bool,
    pub quiet_kernel: bool,
}

/// The scored result nested inside a validate reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub msg: String,
}

/// `POST /validate` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateResponse {
    #[serde(default)]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub result: Verdict,
    #[serde(default)]
    pub log_url: String,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub submission_path: String,
    /// Transient test access point. Sandbox-internal; must never be
    /// forwarded to miners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
}

impl ValidateResponse {
    /// Score clamped into [0, 1]; malformed scores fail closed to 0.
    pub fn clamped_score(&self) -> f64 {
        if self.result.score.is_finite() {
            self.result.score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// JSON form safe to echo to a miner: the tap field is stripped.
    pub fn sanitized_for_miner(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.remove("tap");
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_readiness() {
        let report = HealthReport {
            status: "OK".to_string(),
            token_ready: true,
            sandbox_ready: false,
            token_error: None,
        };
        assert!(report.status_ok());
        assert!(report.is_ready(true, false));
        assert!(!report.is_ready(true, true));

        let down = HealthReport { status: "degraded".to_string(), ..Default::default() };
        assert!(!down.is_ready(false, false));
    }

    #[test]
    fn test_sanitized_reply_drops_tap() {
        let reply = ValidateResponse {
            job_id: "job-1".to_string(),
            tap: Some("tap-internal-9".to_string()),
            ..Default::default()
        };
        let sanitized = reply.sanitized_for_miner();
        assert!(sanitized.get("tap").is_none());
        assert_eq!(sanitized["job_id"], "job-1");
    }

    #[test]
    fn test_score_clamps_and_fails_closed() {
        let mut reply = ValidateResponse::default();
        reply.result.score = 1.7;
        assert_eq!(reply.clamped_score(), 1.0);
        reply.result.score = f64::NAN;
        assert_eq!(reply.clamped_score(), 0.0);
        reply.result.score = -0.2;
        assert_eq!(reply.clamped_score(), 0.0);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SandboxError::Unavailable.is_retryable());
        assert!(SandboxError::QueueFull { retry_after_s: 2 }.is_retryable());
        assert!(SandboxError::Timeout.is_retryable());
        assert!(!SandboxError::Status(400).is_retryable());
        assert!(!SandboxError::Decode("bad".to_string()).is_retryable());
    }
}
