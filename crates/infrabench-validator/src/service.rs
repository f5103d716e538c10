//! Validator service: the perpetual loop and the per-round pipeline.
//!
//! Exactly one round is in flight at any moment; the loop awaits the whole
//! pipeline before the next gate check. Any failure inside a round is
//! contained: the round aborts, state is cleared, and the loop continues.

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, LoopMode};
use crate::dispatch::TaskDispatcher;
use crate::evaluation::{Evaluator, EvaluatorConfig};
use crate::feedback::FeedbackSender;
use crate::gate::RoundGate;
use crate::generation::{TaskGenerator, TaskSource};
use crate::handshake::HandshakeProbe;
use crate::ledger::RoundLedger;
use crate::settlement::{Settlement, SettlementResult};
use crate::summary::{RoundSummaryWriter, ValidatorIdentity};
use infrabench_chain::{ChainClient, MetagraphCache, ScoreBook, WeightEmitter};
use infrabench_protocol::MinerTransport;
use infrabench_sandbox::{SandboxApi, SandboxClient, SandboxPool};
use infrabench_types::{MinerIdentity, Round, RoundPhase};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const DEFAULT_TEMPO: u64 = 360;

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("round aborted during {phase}: {reason}")]
    Abort { phase: &'static str, reason: String },
}

/// What one gate tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub started: bool,
    pub completed: bool,
    pub aborted: bool,
}

/// External collaborators injected at construction.
pub struct ServiceDeps {
    pub chain: Arc<dyn ChainClient>,
    pub transport: Arc<dyn MinerTransport>,
    pub task_source: Arc<dyn TaskSource>,
    pub sandbox_api: Option<Arc<dyn SandboxApi>>,
    /// On-chain weight emission seam. `None` when emission is handled by
    /// external substrate tooling.
    pub weight_emitter: Option<Arc<dyn WeightEmitter>>,
    /// Validator hotkey as published on chain; used for slot derivation
    /// and telemetry.
    pub hotkey: Option<String>,
}

pub struct ValidatorService {
    config: Config,
    chain: Arc<dyn ChainClient>,
    transport: Arc<dyn MinerTransport>,
    metagraph: Arc<MetagraphCache>,
    generator: Arc<TaskGenerator>,
    sandbox: Option<Arc<SandboxPool>>,
    score_book: Arc<ScoreBook>,
    ledger: Arc<RoundLedger>,
    summaries: RoundSummaryWriter,
    checkpoints: CheckpointStore,
    gate: RoundGate,
    settlement: Settlement,
    miner_semaphore: Arc<Semaphore>,
    weight_emitter: Option<Arc<dyn WeightEmitter>>,
    hotkey: Option<String>,
    tempo: u64,
    rounds_started: u64,
}

impl ValidatorService {
    pub fn new(config: Config, deps: ServiceDeps) -> Self {
        let ledger = Arc::new(RoundLedger::new(
            &config.persistence.ledger_dir,
            &config.node.process_name,
            config.persistence.ledger_enabled,
        ));
        let generator = Arc::new(TaskGenerator::new(
            deps.task_source,
            config.tasks.clone(),
            Arc::clone(&ledger),
        ));
        let sandbox = deps.sandbox_api.map(|api| {
            let client = Arc::new(SandboxClient::new(api, config.validation.retries));
            Arc::new(SandboxPool::new(client, config.concurrency.validation_concurrency))
        });
        let metagraph = Arc::new(MetagraphCache::new(
            config.node.netuid,
            Duration::from_secs_f64(config.persistence.metagraph_resync_seconds.max(1.0)),
        ));
        let summaries = RoundSummaryWriter::new(
            &config.persistence.round_summary_dir,
            config.persistence.round_summary_enabled,
            ValidatorIdentity {
                hotkey: deps.hotkey.clone(),
                uid: config.node.uid,
                netuid: config.node.netuid,
                process_name: config.node.process_name.clone(),
            },
        );
        let checkpoints = CheckpointStore::new(
            &config.persistence.checkpoint_dir,
            config.persistence.enable_checkpoint_system,
        );
        let gate = RoundGate::new(config.gate.clone(), config.node.uid, deps.hotkey.clone());
        let settlement = Settlement::new(
            config.settlement.burn_uid,
            config.settlement.weights_min_interval_seconds,
        );
        let miner_semaphore = Arc::new(Semaphore::new(config.concurrency.miner_concurrency));
        let score_book = Arc::new(ScoreBook::new(config.settlement.ema_alpha));

        Self {
            chain: deps.chain,
            transport: deps.transport,
            metagraph,
            generator,
            sandbox,
            score_book,
            ledger,
            summaries,
            checkpoints,
            gate,
            settlement,
            miner_semaphore,
            weight_emitter: deps.weight_emitter,
            hotkey: deps.hotkey,
            tempo: DEFAULT_TEMPO,
            rounds_started: 0,
            config,
        }
    }

    pub fn score_book(&self) -> Arc<ScoreBook> {
        Arc::clone(&self.score_book)
    }

    pub fn ledger(&self) -> Arc<RoundLedger> {
        Arc::clone(&self.ledger)
    }

    /// One-time startup work. Only two things are allowed to kill the
    /// process: a missing identity upstream and a failed fail-fast health
    /// check here.
    pub async fn startup(&mut self) -> anyhow::Result<()> {
        let removed = self.checkpoints.gc_stale();
        if removed > 0 {
            info!(removed, "stale checkpoints removed at startup");
        }

        self.tempo = match self.chain.tempo(self.config.node.netuid).await {
            Ok(tempo) if tempo > 0 => tempo,
            Ok(_) | Err(_) => {
                warn!(fallback = DEFAULT_TEMPO, "tempo lookup failed; using default");
                DEFAULT_TEMPO
            }
        };

        if let Err(e) = self.metagraph.resync_now(self.chain.as_ref()).await {
            warn!("initial metagraph sync failed: {e}");
        }

        if self.config.validation.enabled && self.config.validation.fail_fast_on_startup {
            let Some(sandbox) = self.sandbox.as_ref() else {
                anyhow::bail!("validation api enabled but no sandbox client configured");
            };
            let report = sandbox
                .health()
                .await
                .map_err(|e| anyhow::anyhow!("validation api health check failed: {e}"))?;
            if !report.is_ready(
                self.config.validation.require_token_ready,
                self.config.validation.require_sandbox_ready,
            ) {
                anyhow::bail!(
                    "validation api not ready at startup: status={} token_ready={} sandbox_ready={}",
                    report.status,
                    report.token_ready,
                    report.sandbox_ready
                );
            }
            info!("validation api healthy at startup");
        }

        self.ledger.write(
            "validator_meta",
            json!({
                "hotkey": self.hotkey,
                "uid": self.config.node.uid,
                "netuid": self.config.node.netuid,
                "tempo": self.tempo,
                "process_name": self.config.node.process_name,
            }),
        );
        Ok(())
    }

    /// The perpetual loop. Runs until the surrounding task is cancelled.
    pub async fn run(&mut self) {
        info!(mode = ?self.config.gate.loop_mode, "validator loop started");
        loop {
            let outcome = self.tick().await;
            let sleep_s = match self.config.gate.loop_mode {
                LoopMode::Timed => self.config.gate.tick_seconds,
                LoopMode::Epoch => {
                    if outcome.started {
                        self.config.gate.round_cadence_seconds
                    } else {
                        self.config.gate.tick_seconds
                    }
                }
            };
            tokio::time::sleep(Duration::from_secs_f64(sleep_s.max(0.25))).await;
        }
    }

    /// One gate check, possibly running a full round to completion.
    pub async fn tick(&mut self) -> TickOutcome {
        self.metagraph.maybe_resync(self.chain.as_ref()).await;

        let current_block = match self.chain.current_block().await {
            Ok(block) => block,
            Err(e) => {
                warn!("could not read current block: {e}");
                return TickOutcome::default();
            }
        };

        let now = tokio::time::Instant::now();
        let decision = self.gate.decide(now, current_block, self.tempo);
        self.gate.log_decision(now, current_block, self.tempo, &decision);
        if !decision.should_start() {
            return TickOutcome::default();
        }

        let epoch = infrabench_chain::epoch_of(current_block, self.tempo);
        self.gate.mark_started(now, epoch, current_block);
        self.rounds_started += 1;
        let round_id = format!(
            "round-{:06}-{:08x}",
            self.rounds_started,
            rand::random::<u32>()
        );

        match self.run_round(&round_id, current_block).await {
            Ok(()) => TickOutcome { started: true, completed: true, aborted: false },
            Err(PhaseError::Abort { phase, reason }) => {
                warn!(round_id, phase, "round aborted: {reason}");
                self.ledger.write(
                    "round_aborted",
                    json!({"round_id": round_id, "phase": phase, "reason": reason}),
                );
                self.finish_round_state(&round_id);
                TickOutcome { started: true, completed: false, aborted: true }
            }
        }
    }

    async fn run_round(&mut self, round_id: &str, current_block: u64) -> Result<(), PhaseError> {
        let mut round = Round::new(round_id, current_block, self.tempo);
        info!(round_id, block = current_block, epoch = round.epoch, "round started");
        self.ledger.write(
            "round_start",
            json!({"round_id": round_id, "block": current_block, "epoch": round.epoch}),
        );

        // Phase 2: task generation.
        self.advance(&mut round, RoundPhase::Generating)?;
        let tasks = self
            .generator
            .generate_round_tasks(round_id, self.config.tasks.tasks_per_round)
            .await
            .map_err(|e| PhaseError::Abort { phase: "generating", reason: e.to_string() })?;
        round.tasks = tasks;
        self.checkpoints.save(&round);

        // Phase 3: handshake probe.
        self.advance(&mut round, RoundPhase::Handshaking)?;
        let probe = HandshakeProbe::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.miner_semaphore),
            Duration::from_secs_f64(self.config.timeouts.handshake_timeout_seconds),
        );
        let candidates = self.metagraph.miners();
        let handshake = probe.run(round_id, &candidates, &self.ledger).await;
        round.active_uids = handshake.alive_uids.clone();
        self.checkpoints.save(&round);

        if round.active_uids.is_empty() {
            return Err(PhaseError::Abort {
                phase: "handshaking",
                reason: "no alive miners after handshake".to_string(),
            });
        }

        let targets: Vec<MinerIdentity> = round
            .active_uids
            .iter()
            .filter_map(|uid| self.metagraph.get(*uid))
            .collect();

        // Phase 4: dispatch.
        self.advance(&mut round, RoundPhase::Dispatching)?;
        let dispatcher = TaskDispatcher::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.miner_semaphore),
            Duration::from_secs_f64(self.config.timeouts.task_timeout_seconds),
            Duration::from_secs_f64(self.config.timeouts.dispatch_progress_log_interval_s),
        );
        let dispatch = dispatcher.run(round_id, &round.tasks, &targets, &self.ledger).await;
        round.responses = dispatch.responses.clone();
        self.checkpoints.save(&round);

        // Phase 5: evaluation.
        self.advance(&mut round, RoundPhase::Evaluating)?;
        let evaluator = Evaluator::new(
            self.sandbox.clone(),
            EvaluatorConfig {
                validation_enabled: self.config.validation.enabled,
                validation_timeout_s: self.config.validation.timeout_seconds,
                require_token_ready: self.config.validation.require_token_ready,
                require_sandbox_ready: self.config.validation.require_sandbox_ready,
                scoring: self.config.scoring.clone(),
                weights: self.config.score_weights(),
            },
        );
        let evaluation = evaluator
            .run(round_id, &round.tasks, &dispatch, &self.generator, &self.ledger)
            .await;
        round.outcomes = evaluation.outcomes.clone();
        round.final_scores = evaluation.final_scores.clone();
        self.checkpoints.save(&round);

        // Phase 6: feedback, then cleanup.
        self.advance(&mut round, RoundPhase::Feedback)?;
        let sender = FeedbackSender::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.miner_semaphore),
            Duration::from_secs_f64(self.config.timeouts.miner_response_timeout_seconds),
        );
        sender
            .send_feedback(
                round_id,
                &round.tasks,
                &targets,
                &round.final_scores,
                &dispatch.latencies,
            )
            .await;

        self.advance(&mut round, RoundPhase::Cleanup)?;
        sender
            .send_cleanup(round_id, &targets, &evaluation.validation_replies, &self.ledger)
            .await;
        self.checkpoints.save(&round);

        // Phase 7: settlement.
        self.advance(&mut round, RoundPhase::Settling)?;
        let settlement = self
            .settlement
            .run(
                round_id,
                &round.final_scores,
                &round.active_uids,
                &self.score_book,
                &self.ledger,
            )
            .await;

        // Hand the rolling weights to the emission seam, when one is wired.
        if settlement.skipped_reason.is_none() {
            if let Some(emitter) = self.weight_emitter.as_ref() {
                if let Some((uids, weights)) = self.score_book.weights() {
                    if let Err(e) = emitter.emit(&uids, &weights).await {
                        warn!(round_id, "weight emission failed: {e}");
                    }
                }
            }
        }

        self.advance(&mut round, RoundPhase::Done)?;
        self.write_summary(&round, &handshake.replies, &dispatch.failures, &settlement);
        self.finish_round_state(round_id);
        info!(round_id, "round completed");
        Ok(())
    }

    fn advance(&self, round: &mut Round, to: RoundPhase) -> Result<(), PhaseError> {
        round.advance(to).map_err(|e| PhaseError::Abort {
            phase: "state_machine",
            reason: e.to_string(),
        })
    }

    fn write_summary(
        &self,
        round: &Round,
        handshake_replies: &std::collections::HashMap<
            infrabench_types::Uid,
            Option<infrabench_protocol::HandshakeReply>,
        >,
        failures: &std::collections::HashMap<
            (infrabench_types::Uid, String),
            crate::dispatch::DispatchFailure,
        >,
        settlement: &SettlementResult,
    ) {
        let generated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let summary =
            self.summaries.build(round, handshake_replies, failures, settlement, generated_at);
        self.summaries.write(&round.round_id, &summary);
    }

    /// Terminal-state cleanup shared by completion and abort: checkpoint
    /// gone, per-round generator memory gone, pool refill kicked off.
    fn finish_round_state(&self, round_id: &str) {
        self.checkpoints.delete(round_id);
        self.generator.clear_round(round_id);
        if self.config.tasks.pre_generated_tasks > 0 {
            let generator = Arc::clone(&self.generator);
            tokio::spawn(async move {
                generator.refill_pool().await;
            });
        }
    }
}
