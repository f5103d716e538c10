//! Per-round JSON summary.
//!
//! The ledger is an append-only event stream; this module materializes one
//! self-contained JSON document per completed round that is easy to
//! inspect or upload later. The build step is deterministic for a given
//! round state so replays reproduce identical documents.

use crate::dispatch::DispatchFailure;
use crate::settlement::SettlementResult;
use infrabench_protocol::HandshakeReply;
use infrabench_types::{DeliveryStatus, Round, Uid};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct ValidatorIdentity {
    pub hotkey: Option<String>,
    pub uid: Option<Uid>,
    pub netuid: u16,
    pub process_name: String,
}

pub struct RoundSummaryWriter {
    enabled: bool,
    dir: PathBuf,
    identity: ValidatorIdentity,
}

impl RoundSummaryWriter {
    pub fn new(dir: &Path, enabled: bool, identity: ValidatorIdentity) -> Self {
        Self { enabled, dir: dir.to_path_buf(), identity }
    }

    /// Assemble the summary document. `generated_at` is injected so the
    /// caller controls the only non-deterministic field.
    pub fn build(
        &self,
        round: &Round,
        handshake_replies: &HashMap<Uid, Option<HandshakeReply>>,
        dispatch_failures: &HashMap<(Uid, String), DispatchFailure>,
        settlement: &SettlementResult,
        generated_at: f64,
    ) -> Value {
        let tasks: Vec<Value> = round
            .tasks
            .iter()
            .map(|task| {
                json!({
                    "task_id": task.task_id,
                    "provider": task.provider,
                    "kind": task.kind,
                    "prompt": task.prompt,
                    "invariant_count": task.invariants().len(),
                })
            })
            .collect();

        // BTreeMap keys give a stable miner ordering in the output.
        let mut miners: BTreeMap<Uid, Value> = BTreeMap::new();
        for (uid, by_task) in &round.responses {
            let mut task_rows: Vec<Value> = Vec::new();
            let mut task_ids: Vec<&String> = by_task.keys().collect();
            task_ids.sort();
            for task_id in task_ids {
                let response = &by_task[task_id];
                let failure = dispatch_failures.get(&(*uid, task_id.clone()));
                let outcome = round.outcomes.get(uid).and_then(|m| m.get(task_id));
                task_rows.push(json!({
                    "task_id": task_id,
                    "ack": response.delivery_status == DeliveryStatus::Ok,
                    "delivery_status": response.delivery_status,
                    "dispatch_failure": failure.map(|f| json!({
                        "reason": f.reason,
                        "error": f.error,
                    })),
                    "latency_s": response.latency_seconds,
                    "workspace_zip_sha256": response.workspace_zip_sha256,
                    "workspace_zip_size_bytes": response.workspace_zip_size,
                    "validation": outcome.map(|o| json!({
                        "status": o.status.as_str(),
                        "api_score": o.api_score,
                        "final_score": o.final_score,
                        "job_id": o.validation_job_id,
                        "retries": o.retries,
                    })),
                }));
            }
            let handshake = handshake_replies.get(uid).and_then(|r| r.as_ref());
            miners.insert(
                *uid,
                json!({
                    "uid": uid,
                    "is_alive": round.active_uids.contains(uid),
                    "handshake": {
                        "miner_version": handshake.map(|h| h.miner_version.clone()),
                        "available_capacity": handshake.map(|h| h.available_capacity),
                        "error_message": handshake.and_then(|h| h.error_message.clone()),
                    },
                    "tasks": task_rows,
                    "final_score": round.final_scores.get(uid),
                }),
            );
        }

        // Histogram of validation statuses across every slot, including
        // rounds where the sandbox was down the whole time.
        let mut status_counts: BTreeMap<&'static str, u64> = BTreeMap::new();
        for by_task in round.outcomes.values() {
            for outcome in by_task.values() {
                *status_counts.entry(outcome.status.as_str()).or_insert(0) += 1;
            }
        }

        json!({
            "round_id": round.round_id,
            "generated_at": generated_at,
            "start_block": round.start_block,
            "epoch": round.epoch,
            "phase": round.phase,
            "validator": {
                "hotkey": self.identity.hotkey,
                "uid": self.identity.uid,
                "netuid": self.identity.netuid,
                "process_name": self.identity.process_name,
            },
            "tasks": tasks,
            "miners": miners.values().collect::<Vec<_>>(),
            "validation_summary": { "status_counts": status_counts },
            "settlement": {
                "skipped_reason": settlement.skipped_reason,
                "weights": settlement
                    .weights
                    .iter()
                    .map(|(uid, w)| (uid.to_string(), *w))
                    .collect::<BTreeMap<String, f64>>(),
            },
        })
    }

    /// Write `<round_id>.json` and mirror it to `latest.json`. Best-effort:
    /// telemetry failures never fail the round.
    pub fn write(&self, round_id: &str, summary: &Value) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            debug!("round summary dir unavailable: {e}");
            return None;
        }
        let body = match serde_json::to_string_pretty(summary) {
            Ok(body) => body + "\n",
            Err(_) => return None,
        };
        let out_path = self.dir.join(format!("{round_id}.json"));
        if let Err(e) = std::fs::write(&out_path, &body) {
            debug!("round summary write failed: {e}");
            return None;
        }
        let _ = std::fs::write(self.dir.join("latest.json"), &body);
        info!(round_id, path = %out_path.display(), "round summary written");
        Some(out_path)
    }
}
