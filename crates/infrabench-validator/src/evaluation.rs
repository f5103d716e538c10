//! Evaluation: sandbox validation plus relative latency scoring.
//!
//! For every (miner, task) slot the evaluator submits the returned
//! workspace archive to the sandbox service against the validator's
//! remembered invariants, then folds per-task correctness and per-round
//! relative latency into one final score per miner.
//!
//! Correctness fails closed: an api_score of zero produces a final score
//! of zero no matter how fast the miner answered.

use crate::config::ScoringConfig;
use crate::dispatch::DispatchOutcome;
use crate::generation::TaskGenerator;
use crate::ledger::RoundLedger;
use infrabench_sandbox::{SandboxPool, ValidateRequest, ValidateResponse};
use infrabench_types::{
    DeliveryStatus, TaskSpec, Uid, ValidationOutcome, ValidationStatus,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    /// uid -> combined final score in [0, 1].
    pub final_scores: HashMap<Uid, f64>,
    /// uid -> arithmetic mean of per-task api scores.
    pub api_averages: HashMap<Uid, f64>,
    /// uid -> task_id -> per-slot outcome.
    pub outcomes: HashMap<Uid, HashMap<String, ValidationOutcome>>,
    /// uid -> average dispatch latency across the round's tasks.
    pub avg_latencies: HashMap<Uid, f64>,
    /// Raw sandbox replies kept for the cleanup phase.
    pub validation_replies: HashMap<Uid, HashMap<String, ValidateResponse>>,
    pub duration_s: f64,
}

pub struct EvaluatorConfig {
    pub validation_enabled: bool,
    /// Seconds granted to the sandbox for one validation job.
    pub validation_timeout_s: u64,
    pub require_token_ready: bool,
    pub require_sandbox_ready: bool,
    pub scoring: ScoringConfig,
    /// Normalized (api, latency) weights.
    pub weights: (f64, f64),
}

pub struct Evaluator {
    sandbox: Option<Arc<SandboxPool>>,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(sandbox: Option<Arc<SandboxPool>>, config: EvaluatorConfig) -> Self {
        Self { sandbox, config }
    }

    pub async fn run(
        &self,
        round_id: &str,
        tasks: &[TaskSpec],
        dispatch: &DispatchOutcome,
        generator: &TaskGenerator,
        ledger: &RoundLedger,
    ) -> EvaluationOutcome {
        let started = tokio::time::Instant::now();
        let mut uids: Vec<Uid> = dispatch.responses.keys().copied().collect();
        uids.sort_unstable();
        info!(round_id, miners = uids.len(), tasks = tasks.len(), "evaluating responses");
        ledger.write(
            "evaluation_start",
            json!({
                "round_id": round_id,
                "task_ids": tasks.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>(),
                "target_uids": uids,
            }),
        );

        // Per-uid evaluations run cooperatively; sandbox submissions are
        // bounded by the pool's permit count.
        let evaluations = futures::future::join_all(
            uids.iter()
                .map(|uid| self.evaluate_uid(round_id, *uid, tasks, dispatch, generator)),
        )
        .await;

        let mut outcome = EvaluationOutcome::default();
        for (uid, per_task, replies) in evaluations {
            let count = per_task.len().max(1);
            let api_avg: f64 =
                per_task.values().map(|o| o.api_score).sum::<f64>() / count as f64;
            outcome.api_averages.insert(uid, api_avg);
            outcome.avg_latencies.insert(uid, average_latency(uid, tasks, dispatch));
            outcome.outcomes.insert(uid, per_task);
            if !replies.is_empty() {
                outcome.validation_replies.insert(uid, replies);
            }
            if api_avg > 0.0 {
                info!(uid, api_avg = format!("{api_avg:.4}"), "miner evaluated");
            } else {
                info!(uid, "miner evaluated: no valid submissions");
            }
        }

        // Relative latency component, computed across the round's miners.
        let latency_scores = if self.config.scoring.latency_scoring_enabled {
            relative_latency_scores(&outcome.avg_latencies, &uids, &self.config.scoring)
        } else {
            HashMap::new()
        };

        let (w_api, w_lat) = self.config.weights;
        for uid in &uids {
            let api_avg = outcome.api_averages.get(uid).copied().unwrap_or(0.0);
            let final_score = if !self.config.scoring.latency_scoring_enabled {
                api_avg.clamp(0.0, 1.0)
            } else if api_avg <= 0.0 {
                // Fail closed: latency cannot rescue a wrong submission.
                info!(uid, "api score 0 -> final 0 (latency ignored)");
                0.0
            } else {
                let lat_score = latency_scores.get(uid).copied().unwrap_or(1.0);
                let combined = (w_api * api_avg + w_lat * lat_score).clamp(0.0, 1.0);
                info!(
                    uid,
                    api = format!("{api_avg:.4}"),
                    lat_score = format!("{lat_score:.4}"),
                    combined = format!("{combined:.4}"),
                    "combined score"
                );
                combined
            };
            outcome.final_scores.insert(*uid, final_score);

            // Stamp per-slot final scores for the round summary; fail-closed
            // applies slot by slot as well.
            if let Some(per_task) = outcome.outcomes.get_mut(uid) {
                let lat_score = latency_scores.get(uid).copied().unwrap_or(1.0);
                for slot in per_task.values_mut() {
                    slot.final_score = if slot.api_score <= 0.0 {
                        0.0
                    } else if self.config.scoring.latency_scoring_enabled {
                        (w_api * slot.api_score + w_lat * lat_score).clamp(0.0, 1.0)
                    } else {
                        slot.api_score.clamp(0.0, 1.0)
                    };
                }
            }
        }

        outcome.duration_s = started.elapsed().as_secs_f64();
        let valid = outcome.final_scores.values().filter(|s| **s > 0.0).count();
        info!(
            round_id,
            valid,
            total = uids.len(),
            duration_s = format!("{:.2}", outcome.duration_s),
            "evaluation completed"
        );
        ledger.write(
            "evaluation_complete",
            json!({
                "round_id": round_id,
                "evaluation_time_s": outcome.duration_s,
                "valid_scores": valid,
                "scores": uids
                    .iter()
                    .map(|uid| json!({
                        "uid": uid,
                        "api_avg": outcome.api_averages.get(uid),
                        "avg_latency_s": outcome.avg_latencies.get(uid),
                        "final_score": outcome.final_scores.get(uid),
                        "statuses": outcome
                            .outcomes
                            .get(uid)
                            .map(|by_task| by_task
                                .iter()
                                .map(|(task_id, o)| json!({
                                    "task_id": task_id,
                                    "status": o.status.as_str(),
                                    "api_score": o.api_score,
                                    "retries": o.retries,
                                    "job_id": o.validation_job_id,
                                }))
                                .collect::<Vec<_>>()),
                    }))
                    .collect::<Vec<_>>(),
            }),
        );
        outcome
    }

    async fn evaluate_uid(
        &self,
        round_id: &str,
        uid: Uid,
        tasks: &[TaskSpec],
        dispatch: &DispatchOutcome,
        generator: &TaskGenerator,
    ) -> (Uid, HashMap<String, ValidationOutcome>, HashMap<String, ValidateResponse>) {
        let mut per_task = HashMap::new();
        let mut replies = HashMap::new();
        let by_task = dispatch.responses.get(&uid);

        for task in tasks {
            let task_id = task.task_id.as_str();
            let response = by_task.and_then(|m| m.get(task_id));
            let latency = response.map(|r| r.latency_seconds).unwrap_or(0.0);

            let Some(response) = response else {
                per_task.insert(
                    task_id.to_string(),
                    ValidationOutcome::failed(uid, task_id, latency, ValidationStatus::NoResponse),
                );
                continue;
            };
            if response.delivery_status != DeliveryStatus::Ok {
                per_task.insert(
                    task_id.to_string(),
                    ValidationOutcome::failed(uid, task_id, latency, ValidationStatus::NoResponse),
                );
                continue;
            }
            let Some(zip) = response.workspace_zip.as_ref().filter(|z| !z.is_empty()) else {
                per_task.insert(
                    task_id.to_string(),
                    ValidationOutcome::failed(
                        uid,
                        task_id,
                        latency,
                        ValidationStatus::NoSubmissionZip,
                    ),
                );
                continue;
            };

            // Only the validator's remembered invariants count. Anything a
            // miner may have embedded in its payload is ignored outright.
            let canonical = generator.canonical_task_json(round_id, task_id);
            let invariant_count = canonical
                .as_ref()
                .and_then(|v| v.get("invariants"))
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            let Some(mut task_json) = canonical.filter(|_| invariant_count > 0) else {
                warn!(uid, task_id, "no canonical invariants remembered; zero-scoring slot");
                per_task.insert(
                    task_id.to_string(),
                    ValidationOutcome::failed(
                        uid,
                        task_id,
                        latency,
                        ValidationStatus::MissingInvariants,
                    ),
                );
                continue;
            };
            if let Value::Object(ref mut map) = task_json {
                map.insert("miner_uid".to_string(), Value::from(uid));
            }

            if !self.config.validation_enabled {
                // Test mode: every submission counts as correct.
                per_task.insert(
                    task_id.to_string(),
                    ValidationOutcome {
                        uid,
                        task_id: task_id.to_string(),
                        api_score: 1.0,
                        latency_seconds: latency,
                        final_score: 0.0,
                        validation_job_id: None,
                        status: ValidationStatus::ApiDisabled,
                        retries: 0,
                    },
                );
                continue;
            }

            let outcome = self.submit_to_sandbox(uid, task_id, latency, zip, task_json).await;
            if let Some(reply) = outcome.1 {
                replies.insert(task_id.to_string(), reply);
            }
            per_task.insert(task_id.to_string(), outcome.0);
        }
        (uid, per_task, replies)
    }

    async fn submit_to_sandbox(
        &self,
        uid: Uid,
        task_id: &str,
        latency: f64,
        zip: &[u8],
        task_json: Value,
    ) -> (ValidationOutcome, Option<ValidateResponse>) {
        let Some(pool) = self.sandbox.as_ref() else {
            return (
                ValidationOutcome::failed(uid, task_id, latency, ValidationStatus::ApiError),
                None,
            );
        };

        if !pool
            .is_healthy(self.config.require_token_ready, self.config.require_sandbox_ready)
            .await
        {
            warn!(uid, task_id, "validation api unhealthy; zero-scoring slot");
            return (
                ValidationOutcome::failed(uid, task_id, latency, ValidationStatus::ApiUnhealthy),
                None,
            );
        }

        // The sandbox reads the archive from a shared filesystem path.
        let workspace = match materialize_zip(uid, task_id, zip) {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!(uid, task_id, "failed to materialize workspace zip: {e}");
                return (
                    ValidationOutcome::failed(uid, task_id, latency, ValidationStatus::ApiError),
                    None,
                );
            }
        };

        let request = ValidateRequest {
            workspace_zip_path: workspace.zip_path.to_string_lossy().into_owned(),
            task_json,
            timeout_s: (self.config.validation_timeout_s / 2).max(1),
            net_checks: false,
            stream_log: false,
            quiet_kernel: true,
        };

        let result = pool.validate(&request).await;
        drop(workspace);

        match result {
            Ok(validated)
                if validated.response.job_id.is_empty()
                    && validated.response.result.status.is_empty() =>
            {
                // The service accepted the job but sent back an empty verdict.
                warn!(uid, task_id, "validation api returned an empty verdict");
                (
                    ValidationOutcome::failed(
                        uid,
                        task_id,
                        latency,
                        ValidationStatus::ApiReturnedNone,
                    ),
                    None,
                )
            }
            Ok(validated) => {
                let score = validated.response.clamped_score();
                debug!(
                    uid,
                    task_id,
                    job_id = %validated.response.job_id,
                    score = format!("{score:.4}"),
                    retries = validated.retries,
                    "validation verdict"
                );
                (
                    ValidationOutcome {
                        uid,
                        task_id: task_id.to_string(),
                        api_score: score,
                        latency_seconds: latency,
                        final_score: 0.0,
                        validation_job_id: Some(validated.response.job_id.clone()),
                        status: ValidationStatus::Validated,
                        retries: validated.retries,
                    },
                    Some(validated.response),
                )
            }
            Err(e) => {
                warn!(uid, task_id, "validation submission failed: {e}");
                (
                    ValidationOutcome::failed(uid, task_id, latency, ValidationStatus::ApiError),
                    None,
                )
            }
        }
    }
}

/// Temp directory holding one submission archive; removed on drop.
struct MaterializedZip {
    _dir: tempfile::TempDir,
    zip_path: std::path::PathBuf,
}

fn materialize_zip(uid: Uid, task_id: &str, zip: &[u8]) -> std::io::Result<MaterializedZip> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("infrabench-eval-{uid}-{task_id}-"))
        .tempdir()?;
    let zip_path = dir.path().join("workspace.zip");
    let mut file = std::fs::File::create(&zip_path)?;
    file.write_all(zip)?;
    Ok(MaterializedZip { _dir: dir, zip_path })
}

/// uid's average dispatch latency across the round's tasks.
fn average_latency(uid: Uid, tasks: &[TaskSpec], dispatch: &DispatchOutcome) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for task in tasks {
        if let Some(latency) = dispatch.latencies.get(&(uid, task.task_id.clone())) {
            sum += latency;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Relative latency scores across the round's miners.
///
/// Normal mode maps each miner's average latency onto [0, 1] against the
/// observed min/max and shapes it with gamma. When the whole field is
/// within `latency_tie_epsilon_s`, normalized deltas collapse, so a
/// deterministic rank-based spread keeps the component meaningful:
/// fastest gets 1.0, slowest 1 - penalty, ranks broken by uid.
pub fn relative_latency_scores(
    avg_latencies: &HashMap<Uid, f64>,
    uids: &[Uid],
    scoring: &ScoringConfig,
) -> HashMap<Uid, f64> {
    let observed: Vec<f64> = uids
        .iter()
        .filter_map(|uid| avg_latencies.get(uid))
        .copied()
        .collect();
    let min_lat = observed.iter().copied().fold(f64::INFINITY, f64::min);
    let max_lat = observed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if observed.is_empty() {
        return uids.iter().map(|uid| (*uid, 1.0)).collect();
    }
    let range = max_lat - min_lat;
    let tie_penalty = scoring.latency_tie_penalty_max.clamp(0.0, 1.0);
    let tie_mode =
        observed.len() >= 2 && range <= scoring.latency_tie_epsilon_s && tie_penalty > 0.0;

    let mut scores = HashMap::new();
    if tie_mode {
        info!(
            range_s = format!("{range:.6}"),
            eps_s = scoring.latency_tie_epsilon_s,
            penalty_max = tie_penalty,
            "latency tie-spread engaged"
        );
        let mut ranked: Vec<Uid> = uids.to_vec();
        ranked.sort_by(|a, b| {
            let la = avg_latencies.get(a).copied().unwrap_or(max_lat);
            let lb = avg_latencies.get(b).copied().unwrap_or(max_lat);
            la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(b))
        });
        let n = ranked.len();
        for (rank, uid) in ranked.into_iter().enumerate() {
            let score = if n > 1 {
                1.0 - (rank as f64 / (n - 1) as f64) * tie_penalty
            } else {
                1.0
            };
            scores.insert(uid, score.clamp(0.0, 1.0));
        }
    } else {
        let denom = range.max(1e-9);
        let gamma = scoring.latency_score_gamma.max(1e-4);
        for uid in uids {
            // Miners with no recorded latency are treated as slowest.
            let latency = avg_latencies.get(uid).copied().unwrap_or(max_lat);
            let delta = ((latency - min_lat) / denom).clamp(0.0, 1.0);
            scores.insert(*uid, (1.0 - delta).powf(gamma));
        }
    }
    scores
}
