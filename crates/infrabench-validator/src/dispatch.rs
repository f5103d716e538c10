//! Task dispatch: fan every task out to every live miner.
//!
//! One call per (task, miner) pair, all concurrent under the shared miner
//! semaphore. Task calls run long (miners may execute a full Terraform
//! apply), so a heartbeat logs progress while calls are pending and each
//! call measures its own latency for the scoring phase.

use crate::ledger::RoundLedger;
use infrabench_protocol::{send_typed, MinerTransport, TaskRequest};
use infrabench_types::{DeliveryStatus, MinerIdentity, TaskResponse, TaskSpec, Uid};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub reason: String,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// uid -> task_id -> response (every probed slot gets an entry).
    pub responses: HashMap<Uid, HashMap<String, TaskResponse>>,
    /// Per-slot latency seconds, timeouts recorded at the full deadline.
    pub latencies: HashMap<(Uid, String), f64>,
    pub failures: HashMap<(Uid, String), DispatchFailure>,
    pub duration_s: f64,
    pub total_sends: usize,
    pub successful: usize,
}

struct SendResult {
    uid: Uid,
    task_id: String,
    response: TaskResponse,
    failure: Option<DispatchFailure>,
}

pub struct TaskDispatcher {
    transport: Arc<dyn MinerTransport>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    progress_interval: Duration,
}

impl TaskDispatcher {
    pub fn new(
        transport: Arc<dyn MinerTransport>,
        semaphore: Arc<Semaphore>,
        timeout: Duration,
        progress_interval: Duration,
    ) -> Self {
        let progress_interval = progress_interval.max(Duration::from_secs(1));
        Self { transport, semaphore, timeout, progress_interval }
    }

    pub async fn run(
        &self,
        round_id: &str,
        tasks: &[TaskSpec],
        targets: &[MinerIdentity],
        ledger: &RoundLedger,
    ) -> DispatchOutcome {
        let started = tokio::time::Instant::now();
        info!(
            round_id,
            tasks = tasks.len(),
            targets = targets.len(),
            timeout_s = self.timeout.as_secs_f64(),
            "dispatching tasks"
        );
        ledger.write(
            "dispatch_start",
            json!({
                "round_id": round_id,
                "task_ids": tasks.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>(),
                "targets": targets
                    .iter()
                    .map(|m| json!({"uid": m.uid, "address": m.address(), "hotkey": m.hotkey}))
                    .collect::<Vec<_>>(),
            }),
        );

        let mut join_set: JoinSet<SendResult> = JoinSet::new();
        for task in tasks {
            let request = TaskRequest::from_spec(task);
            for target in targets {
                join_set.spawn(self.send_one(request.clone(), target.clone()));
            }
        }

        let total_sends = tasks.len() * targets.len();
        let mut outcome = DispatchOutcome { total_sends, ..Default::default() };
        let mut results: Vec<SendResult> = Vec::with_capacity(total_sends);
        let mut heartbeat = tokio::time::interval(self.progress_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();

        loop {
            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(result)) => results.push(result),
                        Some(Err(e)) => warn!("dispatch task crashed: {e}"),
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    info!(
                        round_id,
                        completed = results.len(),
                        total = total_sends,
                        pending = total_sends.saturating_sub(results.len()),
                        elapsed_s = format!("{:.1}", started.elapsed().as_secs_f64()),
                        "dispatch progress"
                    );
                }
            }
        }

        let mut ledger_results = Vec::with_capacity(results.len());
        for result in results {
            let key = (result.uid, result.task_id.clone());
            outcome.latencies.insert(key.clone(), result.response.latency_seconds);
            if result.response.delivery_status == DeliveryStatus::Ok {
                outcome.successful += 1;
            }
            if let Some(failure) = result.failure {
                outcome.failures.insert(key, failure);
            }
            ledger_results.push(json!({
                "uid": result.uid,
                "task_id": result.task_id,
                "ack": result.response.delivery_status == DeliveryStatus::Ok,
                "status": result.response.delivery_status,
                "latency_s": result.response.latency_seconds,
                "workspace_zip_sha256": result.response.workspace_zip_sha256,
                "workspace_zip_size_bytes": result.response.workspace_zip_size,
            }));
            outcome
                .responses
                .entry(result.uid)
                .or_default()
                .insert(result.task_id.clone(), result.response);
        }

        outcome.duration_s = started.elapsed().as_secs_f64();
        info!(
            round_id,
            successful = outcome.successful,
            total = total_sends,
            duration_s = format!("{:.2}", outcome.duration_s),
            "task dispatch completed"
        );
        ledger.write(
            "dispatch_complete",
            json!({
                "round_id": round_id,
                "dispatch_time_s": outcome.duration_s,
                "total_sends": total_sends,
                "successful": outcome.successful,
                "results": ledger_results,
            }),
        );
        outcome
    }

    fn send_one(
        &self,
        request: TaskRequest,
        target: MinerIdentity,
    ) -> impl std::future::Future<Output = SendResult> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let semaphore = Arc::clone(&self.semaphore);
        let deadline = self.timeout;
        async move {
            let task_id = request.task_id.clone();
            let uid = target.uid;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return SendResult {
                    uid,
                    task_id: task_id.clone(),
                    response: TaskResponse::absent(uid, &task_id, 0.0, DeliveryStatus::Error),
                    failure: Some(DispatchFailure {
                        reason: "error".to_string(),
                        error: Some("semaphore closed".to_string()),
                    }),
                };
            };
            let start = tokio::time::Instant::now();
            let result =
                tokio::time::timeout(deadline, send_typed(transport.as_ref(), &target, request))
                    .await;
            let latency = start.elapsed().as_secs_f64();

            match result {
                Ok(Ok(reply)) => {
                    if reply.task_id != task_id {
                        warn!(
                            uid,
                            sent = %task_id,
                            got = %reply.task_id,
                            "miner echoed mismatched task_id; discarding reply"
                        );
                        return SendResult {
                            uid,
                            task_id: task_id.clone(),
                            response: TaskResponse::absent(
                                uid,
                                &task_id,
                                latency,
                                DeliveryStatus::NoResponse,
                            ),
                            failure: Some(DispatchFailure {
                                reason: "task_id_mismatch".to_string(),
                                error: Some(format!("echoed {}", reply.task_id)),
                            }),
                        };
                    }
                    let zip = reply.decode_workspace_zip();
                    debug!(uid, task = %task_id, latency_s = format!("{latency:.2}"), "task reply received");
                    SendResult {
                        uid,
                        task_id: task_id.clone(),
                        response: TaskResponse::received(uid, &task_id, zip, latency),
                        failure: None,
                    }
                }
                Ok(Err(e)) => {
                    debug!(uid, task = %task_id, "task send error: {e}");
                    SendResult {
                        uid,
                        task_id: task_id.clone(),
                        response: TaskResponse::absent(uid, &task_id, latency, DeliveryStatus::Error),
                        failure: Some(DispatchFailure {
                            reason: "error".to_string(),
                            error: Some(e.to_string()),
                        }),
                    }
                }
                Err(_) => {
                    debug!(uid, task = %task_id, "task send timed out");
                    SendResult {
                        uid,
                        task_id: task_id.clone(),
                        // The miner consumed the whole deadline; score it as such.
                        response: TaskResponse::absent(
                            uid,
                            &task_id,
                            deadline.as_secs_f64(),
                            DeliveryStatus::Timeout,
                        ),
                        failure: Some(DispatchFailure { reason: "timeout".to_string(), error: None }),
                    }
                }
            }
        }
    }
}
