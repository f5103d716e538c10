//! Typed request/reply messages.

use base64::Engine;
use infrabench_types::{sha256_hex, TaskSpec};
use serde::{Deserialize, Serialize};

/// Protocol version sent with every request. Miners on a different major
/// line may decline in their handshake reply.
pub const PROTOCOL_VERSION: &str = "infrabench.v1";

// ============================================================
// Handshake
// ============================================================

/// Liveness probe sent before any task dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub round_id: String,
    /// Unix seconds at send time.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub is_ready: bool,
    #[serde(default)]
    pub miner_version: String,
    /// Number of tasks the miner is willing to take this round.
    #[serde(default)]
    pub available_capacity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ============================================================
// Task
// ============================================================

/// Task broadcast. The prompt is the only task content a miner receives;
/// the hidden invariants never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub prompt: String,
}

impl TaskRequest {
    /// Build the dispatchable request from a full spec, keeping only the
    /// public fields.
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self { task_id: spec.task_id.clone(), prompt: spec.dispatch_prompt() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReply {
    /// Echo of the request's task_id; a mismatch invalidates the reply.
    pub task_id: String,
    #[serde(default)]
    pub result_summary: String,
    /// Base64-encoded workspace archive. Absent when the miner declines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_zip_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_zip_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_zip_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_zip_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TaskReply {
    /// Attach an archive, filling in the derived metadata fields.
    pub fn attach_workspace_zip(&mut self, bytes: &[u8], filename: &str) {
        self.workspace_zip_b64 =
            Some(base64::engine::general_purpose::STANDARD.encode(bytes));
        self.workspace_zip_filename = Some(filename.to_string());
        self.workspace_zip_sha256 = Some(sha256_hex(bytes));
        self.workspace_zip_size_bytes = Some(bytes.len() as u64);
    }

    /// Decode the attached archive, if any. Returns `None` both when the
    /// miner declined and when the payload is not valid base64; the caller
    /// treats either as "no submission".
    pub fn decode_workspace_zip(&self) -> Option<Vec<u8>> {
        let b64 = self.workspace_zip_b64.as_deref()?;
        base64::engine::general_purpose::STANDARD.decode(b64).ok()
    }
}

// ============================================================
// Feedback
// ============================================================

/// Per-task score sent to a miner right after evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub round_id: String,
    pub task_id: String,
    pub miner_uid: i64,
    pub score: f64,
    pub latency_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReply {
    pub acknowledged: bool,
}

// ============================================================
// Cleanup
// ============================================================

/// Sandbox verdict echoed back so the miner can free resources.
///
/// `validation_response` is a pre-sanitized JSON object: sandbox-internal
/// fields (the transient test access point in particular) must be stripped
/// before it is placed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub task_id: String,
    pub validation_response: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReply {
    pub acknowledged: bool,
    #[serde(default)]
    pub cleanup_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ============================================================
// Tagged envelope payloads
// ============================================================

/// Every request the validator can send, tagged for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum MinerRequest {
    Handshake(HandshakeRequest),
    Task(TaskRequest),
    Feedback(FeedbackRequest),
    Cleanup(CleanupRequest),
}

impl MinerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            MinerRequest::Handshake(_) => "handshake",
            MinerRequest::Task(_) => "task",
            MinerRequest::Feedback(_) => "feedback",
            MinerRequest::Cleanup(_) => "cleanup",
        }
    }
}

/// Every reply a miner can return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum MinerReply {
    Handshake(HandshakeReply),
    Task(TaskReply),
    Feedback(FeedbackReply),
    Cleanup(CleanupReply),
}

/// Pairs a request type with its reply type so the transport can expose a
/// single generic `send` over all four message kinds.
pub trait RpcMessage: Sized {
    type Reply;

    fn into_request(self) -> MinerRequest;
    /// Extract the typed reply; `None` when the miner answered with the
    /// wrong variant.
    fn reply_from(reply: MinerReply) -> Option<Self::Reply>;
}

macro_rules! impl_rpc_message {
    ($req:ty, $rep:ty, $variant:ident) => {
        impl RpcMessage for $req {
            type Reply = $rep;

            fn into_request(self) -> MinerRequest {
                MinerRequest::$variant(self)
            }

            fn reply_from(reply: MinerReply) -> Option<Self::Reply> {
                match reply {
                    MinerReply::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

impl_rpc_message!(HandshakeRequest, HandshakeReply, Handshake);
impl_rpc_message!(TaskRequest, TaskReply, Task);
impl_rpc_message!(FeedbackRequest, FeedbackReply, Feedback);
impl_rpc_message!(CleanupRequest, CleanupReply, Cleanup);

#[cfg(test)]
mod tests {
    use super::*;
    use infrabench_types::{CanonicalTask, Invariant, TaskParams, TaskSpec};
    use std::collections::BTreeMap;

    fn spec() -> TaskSpec {
        TaskSpec {
            task_id: "t-42".to_string(),
            provider: "gcp".to_string(),
            kind: "compute_instance".to_string(),
            prompt: Some("Create a VM named secret-checked-vm.".to_string()),
            params: TaskParams {
                task: Some(CanonicalTask {
                    task_id: "t-42".to_string(),
                    invariants: vec![Invariant {
                        resource_type: "google_compute_instance".to_string(),
                        matchers: BTreeMap::from([(
                            "values.name".to_string(),
                            serde_json::json!("secret-checked-vm"),
                        )]),
                    }],
                    ..Default::default()
                }),
                extra: BTreeMap::new(),
            },
            policy: Default::default(),
            verify_plan: Default::default(),
        }
    }

    #[test]
    fn test_task_request_carries_no_invariants() {
        let req = TaskRequest::from_spec(&spec());
        let wire = serde_json::to_string(&MinerRequest::Task(req)).unwrap();
        assert!(!wire.contains("invariant"));
        assert!(!wire.contains("resource_type"));
        assert!(wire.contains("secret-checked-vm")); // the prompt itself is public
        assert!(wire.contains("t-42"));
    }

    #[test]
    fn test_workspace_zip_round_trip() {
        let mut reply = TaskReply { task_id: "t-42".to_string(), ..Default::default() };
        reply.attach_workspace_zip(b"PK\x03\x04fake", "workspace.zip");
        assert_eq!(reply.workspace_zip_size_bytes, Some(8));
        assert_eq!(reply.decode_workspace_zip().unwrap(), b"PK\x03\x04fake");
    }

    #[test]
    fn test_decline_has_no_zip() {
        let reply = TaskReply { task_id: "t-42".to_string(), ..Default::default() };
        assert!(reply.decode_workspace_zip().is_none());
    }

    #[test]
    fn test_rpc_message_pairs() {
        let req = HandshakeRequest { round_id: "r-1".to_string(), timestamp: 1 };
        match req.clone().into_request() {
            MinerRequest::Handshake(inner) => assert_eq!(inner, req),
            other => panic!("unexpected variant: {other:?}"),
        }
        // A mismatched reply variant yields None.
        assert!(HandshakeRequest::reply_from(MinerReply::Feedback(FeedbackReply {
            acknowledged: true,
        }))
        .is_none());
        assert!(HandshakeRequest::reply_from(MinerReply::Handshake(HandshakeReply {
            is_ready: true,
            ..Default::default()
        }))
        .is_some());
    }

    #[test]
    fn test_wire_tagging() {
        let req = MinerRequest::Handshake(HandshakeRequest {
            round_id: "r-7".to_string(),
            timestamp: 99,
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "handshake");
        assert_eq!(json["body"]["round_id"], "r-7");
        let back: MinerRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
