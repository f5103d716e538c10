//! Client for the sandbox validation service.
//!
//! The service runs a miner's Terraform workspace inside a microVM and
//! scores it against the validator's hidden invariants. This crate only
//! speaks the HTTP protocol:
//! - `GET /health` → readiness flags
//! - `POST /validate` → scored verdict
//!
//! Retry policy lives in `SandboxClient`: HTTP 429 honors `Retry-After`,
//! HTTP 503 and transport errors back off exponentially, everything else
//! fails the attempt outright.

pub mod api;
pub mod client;
pub mod types;

pub use api::{HttpSandboxApi, MockSandboxApi, SandboxApi};
pub use client::{SandboxClient, SandboxPool, ValidateOutcome};
pub use types::{HealthReport, SandboxError, ValidateRequest, ValidateResponse, Verdict};
