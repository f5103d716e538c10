//! Round gate: decides on each tick whether to start a new round.
//!
//! Timed mode starts a round whenever the configured cadence has elapsed.
//! Epoch mode derives an epoch from the chain clock and starts at most one
//! round per epoch, optionally inside this validator's slot window, and
//! never past the late-start cutoff.

use crate::config::{GateConfig, LoopMode};
use infrabench_chain::{epoch_of, epoch_progress, slot_index_for};
use infrabench_types::Uid;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Start { epoch: u64, reason: String },
    Skip { reason: String },
}

impl GateDecision {
    pub fn should_start(&self) -> bool {
        matches!(self, GateDecision::Start { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            GateDecision::Start { reason, .. } | GateDecision::Skip { reason } => reason,
        }
    }
}

pub struct RoundGate {
    config: GateConfig,
    uid: Option<Uid>,
    hotkey: Option<String>,
    last_started_at: Option<Instant>,
    last_epoch_started: Option<u64>,
    last_start_block: Option<u64>,
    last_gate_log_at: Option<Instant>,
    last_epoch_logged: Option<u64>,
}

impl RoundGate {
    const GATE_LOG_INTERVAL_S: f64 = 60.0;

    pub fn new(config: GateConfig, uid: Option<Uid>, hotkey: Option<String>) -> Self {
        if config.epoch_slots > 1 {
            let slot = Self::slot_of(&config, uid, hotkey.as_deref());
            let window_start = slot as f64 / config.epoch_slots as f64;
            let window_end = (slot + 1) as f64 / config.epoch_slots as f64;
            info!(
                slots = config.epoch_slots,
                slot,
                window_start = format!("{window_start:.2}"),
                window_end = format!("{window_end:.2}"),
                "epoch slotting enabled"
            );
        }
        Self {
            config,
            uid,
            hotkey,
            last_started_at: None,
            last_epoch_started: None,
            last_start_block: None,
            last_gate_log_at: None,
            last_epoch_logged: None,
        }
    }

    /// Configured round duration in blocks: the round spans
    /// `round_size_epochs` minus a safety buffer.
    fn round_duration_blocks(&self, tempo: u64) -> u64 {
        let blocks = (self.config.round_size_epochs - self.config.safety_buffer_epochs)
            * tempo as f64;
        (blocks as u64).max(1)
    }

    fn slot_of(config: &GateConfig, uid: Option<Uid>, hotkey: Option<&str>) -> u32 {
        match config.epoch_slot_index {
            Some(index) => index % config.epoch_slots.max(1),
            None => slot_index_for(uid, hotkey, config.epoch_slots),
        }
    }

    pub fn slot_index(&self) -> u32 {
        Self::slot_of(&self.config, self.uid, self.hotkey.as_deref())
    }

    /// One gate check. `now` comes from the loop so tests can drive time.
    pub fn decide(&self, now: Instant, current_block: u64, tempo: u64) -> GateDecision {
        match self.config.loop_mode {
            LoopMode::Timed => self.decide_timed(now),
            LoopMode::Epoch => self.decide_epoch(current_block, tempo),
        }
    }

    fn decide_timed(&self, now: Instant) -> GateDecision {
        match self.last_started_at {
            Some(at)
                if now.duration_since(at).as_secs_f64()
                    < self.config.round_cadence_seconds =>
            {
                GateDecision::Skip { reason: "timed_cadence_not_elapsed".to_string() }
            }
            _ => GateDecision::Start { epoch: 0, reason: "timed_cadence".to_string() },
        }
    }

    fn decide_epoch(&self, current_block: u64, tempo: u64) -> GateDecision {
        let epoch = epoch_of(current_block, tempo);
        let progress = epoch_progress(current_block, tempo);

        if self.config.one_round_per_epoch && self.last_epoch_started == Some(epoch) {
            return GateDecision::Skip {
                reason: "one_round_per_epoch_already_started".to_string(),
            };
        }

        // The previous round occupies its full duration in blocks.
        if let Some(last_block) = self.last_start_block {
            let next_allowed = last_block + self.round_duration_blocks(tempo);
            if current_block < next_allowed {
                return GateDecision::Skip {
                    reason: format!("round_duration_not_elapsed next_allowed_block={next_allowed}"),
                };
            }
        }

        if tempo > 0 {
            if self.config.epoch_slots > 1 {
                let slot = self.slot_index();
                let window_start = slot as f64 / self.config.epoch_slots as f64;
                let window_end = (slot + 1) as f64 / self.config.epoch_slots as f64;
                if !(window_start <= progress && progress < window_end) {
                    return GateDecision::Skip {
                        reason: format!(
                            "epoch_slot_window slot={slot}/{} window={window_start:.2}-{window_end:.2}",
                            self.config.epoch_slots
                        ),
                    };
                }
            } else if progress > self.config.skip_round_if_started_after_fraction {
                return GateDecision::Skip {
                    reason: "skip_round_if_started_after_fraction".to_string(),
                };
            }
        }

        let reason = if self.config.epoch_slots > 1 {
            format!("starting_round slot={}/{}", self.slot_index(), self.config.epoch_slots)
        } else {
            "starting_round".to_string()
        };
        GateDecision::Start { epoch, reason }
    }

    /// Record a round start so the per-epoch / cadence bookkeeping holds.
    pub fn mark_started(&mut self, now: Instant, epoch: u64, current_block: u64) {
        self.last_started_at = Some(now);
        self.last_epoch_started = Some(epoch);
        self.last_start_block = Some(current_block);
    }

    /// Rate-limited observability line for the gate decision. At most one
    /// line per epoch per minute so a fast tick loop stays readable.
    pub fn log_decision(
        &mut self,
        now: Instant,
        current_block: u64,
        tempo: u64,
        decision: &GateDecision,
    ) {
        let epoch = epoch_of(current_block, tempo);
        if !decision.should_start() {
            let recently_logged = self
                .last_gate_log_at
                .map(|at| now.duration_since(at).as_secs_f64() < Self::GATE_LOG_INTERVAL_S)
                .unwrap_or(false);
            if recently_logged && self.last_epoch_logged == Some(epoch) {
                return;
            }
        }
        self.last_gate_log_at = Some(now);
        self.last_epoch_logged = Some(epoch);

        let tempo_div = tempo.max(1);
        let blocks_into_epoch = current_block % tempo_div;
        info!(
            block = current_block,
            epoch,
            tempo,
            progress = format!("{:.3}", epoch_progress(current_block, tempo)),
            blocks_into_epoch,
            until_epoch_end = tempo_div - blocks_into_epoch,
            start_round = decision.should_start(),
            reason = decision.reason(),
            "epoch gate"
        );
    }
}
