//! Feedback and cleanup: close the loop with miners after evaluation.
//!
//! Both messages are fire-and-forget with a short timeout. Acknowledgments
//! are counted for observability but never gate round progress, and
//! failures are logged rather than retried.

use crate::ledger::RoundLedger;
use infrabench_protocol::{send_typed, CleanupRequest, FeedbackRequest, MinerTransport};
use infrabench_sandbox::ValidateResponse;
use infrabench_types::{MinerIdentity, TaskSpec, Uid};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct AckStats {
    pub sent: usize,
    pub acknowledged: usize,
}

pub struct FeedbackSender {
    transport: Arc<dyn MinerTransport>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl FeedbackSender {
    pub fn new(
        transport: Arc<dyn MinerTransport>,
        semaphore: Arc<Semaphore>,
        timeout: Duration,
    ) -> Self {
        Self { transport, semaphore, timeout }
    }

    /// Send per-(miner, task) scores. Local-test synthetic targets
    /// (negative uids) are skipped; they have no registered identity to
    /// learn against.
    pub async fn send_feedback(
        &self,
        round_id: &str,
        tasks: &[TaskSpec],
        targets: &[MinerIdentity],
        scores: &HashMap<Uid, f64>,
        latencies: &HashMap<(Uid, String), f64>,
    ) -> AckStats {
        let mut join_set: JoinSet<bool> = JoinSet::new();
        let mut sent = 0usize;

        for task in tasks {
            for target in targets.iter().filter(|m| m.uid >= 0) {
                let Some(score) = scores.get(&target.uid).copied() else {
                    continue;
                };
                let latency = latencies
                    .get(&(target.uid, task.task_id.clone()))
                    .copied()
                    .unwrap_or(0.0);
                let request = FeedbackRequest {
                    round_id: round_id.to_string(),
                    task_id: task.task_id.clone(),
                    miner_uid: target.uid,
                    score,
                    latency_seconds: latency,
                    feedback_text: Some(format!("Score: {score:.4}")),
                };
                sent += 1;
                join_set.spawn(self.send_one_feedback(request, target.clone()));
            }
        }

        let mut acknowledged = 0usize;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                acknowledged += 1;
            }
        }
        info!(round_id, acknowledged, sent, "feedback sent");
        AckStats { sent, acknowledged }
    }

    fn send_one_feedback(
        &self,
        request: FeedbackRequest,
        target: MinerIdentity,
    ) -> impl std::future::Future<Output = bool> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let semaphore = Arc::clone(&self.semaphore);
        let deadline = self.timeout;
        async move {
            let uid = target.uid;
            let task_id = request.task_id.clone();
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return false;
            };
            match tokio::time::timeout(deadline, send_typed(transport.as_ref(), &target, request))
                .await
            {
                Ok(Ok(reply)) if reply.acknowledged => {
                    debug!(uid, task = %task_id, "feedback acknowledged");
                    true
                }
                Ok(Ok(_)) => {
                    debug!(uid, task = %task_id, "feedback not acknowledged");
                    false
                }
                Ok(Err(e)) => {
                    debug!(uid, task = %task_id, "feedback send failed: {e}");
                    false
                }
                Err(_) => {
                    debug!(uid, task = %task_id, "feedback timed out");
                    false
                }
            }
        }
    }

    /// Echo the sandbox verdict so miners can tear down their resources.
    /// The payload is sanitized: sandbox-internal fields never leave the
    /// validator.
    pub async fn send_cleanup(
        &self,
        round_id: &str,
        targets: &[MinerIdentity],
        validation_replies: &HashMap<Uid, HashMap<String, ValidateResponse>>,
        ledger: &RoundLedger,
    ) -> AckStats {
        let mut join_set: JoinSet<bool> = JoinSet::new();
        let mut sent = 0usize;

        for target in targets.iter().filter(|m| m.uid >= 0) {
            let Some(by_task) = validation_replies.get(&target.uid) else {
                continue;
            };
            for (task_id, reply) in by_task {
                let request = CleanupRequest {
                    task_id: task_id.clone(),
                    validation_response: reply.sanitized_for_miner(),
                };
                sent += 1;
                join_set.spawn(self.send_one_cleanup(request, target.clone()));
            }
        }

        let mut acknowledged = 0usize;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                acknowledged += 1;
            }
        }
        info!(round_id, acknowledged, sent, "cleanup sent");
        ledger.write(
            "cleanup_complete",
            json!({"round_id": round_id, "sent": sent, "acknowledged": acknowledged}),
        );
        AckStats { sent, acknowledged }
    }

    fn send_one_cleanup(
        &self,
        request: CleanupRequest,
        target: MinerIdentity,
    ) -> impl std::future::Future<Output = bool> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let semaphore = Arc::clone(&self.semaphore);
        let deadline = self.timeout;
        async move {
            let uid = target.uid;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return false;
            };
            match tokio::time::timeout(deadline, send_typed(transport.as_ref(), &target, request))
                .await
            {
                Ok(Ok(reply)) => {
                    if !reply.cleanup_ok {
                        if let Some(message) = reply.error_message {
                            warn!(uid, "miner cleanup reported failure: {message}");
                        }
                    }
                    reply.acknowledged
                }
                Ok(Err(e)) => {
                    debug!(uid, "cleanup send failed: {e}");
                    false
                }
                Err(_) => {
                    debug!(uid, "cleanup timed out");
                    false
                }
            }
        }
    }
}
