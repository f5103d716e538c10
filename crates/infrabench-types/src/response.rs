//! Per-(miner, task) dispatch result.

use crate::miner::Uid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a single dispatch call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// The miner replied in time. The reply may still carry no artifact
    /// (an explicit decline).
    Ok,
    Timeout,
    Error,
    /// No usable reply: transport returned nothing, or the echoed task_id
    /// did not match what was sent.
    NoResponse,
}

/// Artifact and timing collected from one miner for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub uid: Uid,
    pub task_id: String,
    /// Raw workspace archive bytes, if the miner submitted one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_zip: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_zip_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_zip_size: Option<u64>,
    /// Wall-clock seconds from just-before-send to just-after-receive.
    /// Timeouts record the full deadline.
    pub latency_seconds: f64,
    pub delivery_status: DeliveryStatus,
}

impl TaskResponse {
    /// A slot for which no usable reply arrived.
    pub fn absent(uid: Uid, task_id: &str, latency_seconds: f64, status: DeliveryStatus) -> Self {
        Self {
            uid,
            task_id: task_id.to_string(),
            workspace_zip: None,
            workspace_zip_sha256: None,
            workspace_zip_size: None,
            latency_seconds,
            delivery_status: status,
        }
    }

    /// A successful reply carrying an optional artifact. Digest and size are
    /// recomputed locally; the miner-reported values are advisory only.
    pub fn received(uid: Uid, task_id: &str, zip: Option<Vec<u8>>, latency_seconds: f64) -> Self {
        let (sha256, size) = match &zip {
            Some(bytes) => (Some(sha256_hex(bytes)), Some(bytes.len() as u64)),
            None => (None, None),
        };
        Self {
            uid,
            task_id: task_id.to_string(),
            workspace_zip: zip,
            workspace_zip_sha256: sha256,
            workspace_zip_size: size,
            latency_seconds,
            delivery_status: DeliveryStatus::Ok,
        }
    }

    pub fn has_artifact(&self) -> bool {
        self.workspace_zip.as_ref().map(|z| !z.is_empty()).unwrap_or(false)
    }
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_computes_digest() {
        let resp = TaskResponse::received(5, "t-1", Some(b"zipbytes".to_vec()), 1.25);
        assert_eq!(resp.delivery_status, DeliveryStatus::Ok);
        assert!(resp.has_artifact());
        assert_eq!(resp.workspace_zip_size, Some(8));
        assert_eq!(resp.workspace_zip_sha256.as_deref(), Some(sha256_hex(b"zipbytes").as_str()));
    }

    #[test]
    fn test_ok_without_artifact_is_a_decline() {
        let resp = TaskResponse::received(5, "t-1", None, 0.5);
        assert_eq!(resp.delivery_status, DeliveryStatus::Ok);
        assert!(!resp.has_artifact());
    }

    #[test]
    fn test_absent_slot() {
        let resp = TaskResponse::absent(7, "t-2", 1800.0, DeliveryStatus::Timeout);
        assert!(!resp.has_artifact());
        assert_eq!(resp.latency_seconds, 1800.0);
    }
}
