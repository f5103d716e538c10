//! Evaluation outcome for one (miner, task) slot.

use crate::miner::Uid;
use serde::{Deserialize, Serialize};

/// Why a slot received the api_score it did. Every status other than
/// `Validated` and `ApiDisabled` implies an api_score of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// The sandbox scored the submission.
    Validated,
    /// Validation service disabled by configuration; score forced to 1.0.
    ApiDisabled,
    /// The service health check failed mid-round.
    ApiUnhealthy,
    /// Submission failed after all retries.
    ApiError,
    /// The validator had no canonical invariants for this task.
    MissingInvariants,
    /// The miner never replied.
    NoResponse,
    /// The miner replied but attached no workspace archive.
    NoSubmissionZip,
    /// The service accepted the submission but returned an empty verdict.
    ApiReturnedNone,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Validated => "validated",
            ValidationStatus::ApiDisabled => "api_disabled",
            ValidationStatus::ApiUnhealthy => "api_unhealthy",
            ValidationStatus::ApiError => "api_error",
            ValidationStatus::MissingInvariants => "missing_invariants",
            ValidationStatus::NoResponse => "no_response",
            ValidationStatus::NoSubmissionZip => "no_submission_zip",
            ValidationStatus::ApiReturnedNone => "api_returned_none",
        }
    }
}

/// Scored result for one (miner, task) slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub uid: Uid,
    pub task_id: String,
    /// Correctness in [0, 1] as reported by the sandbox; 0 on any failure.
    pub api_score: f64,
    pub latency_seconds: f64,
    /// Combined correctness + latency score. Zero whenever api_score is
    /// zero (fail-closed).
    pub final_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_job_id: Option<String>,
    pub status: ValidationStatus,
    /// Sandbox retries consumed before the verdict.
    #[serde(default)]
    pub retries: u32,
}

impl ValidationOutcome {
    /// A zero-score outcome for a slot that never reached the sandbox.
    pub fn failed(uid: Uid, task_id: &str, latency_seconds: f64, status: ValidationStatus) -> Self {
        Self {
            uid,
            task_id: task_id.to_string(),
            api_score: 0.0,
            latency_seconds,
            final_score: 0.0,
            validation_job_id: None,
            status,
            retries: 0,
        }
    }
}
