//! Per-round state machine.
//!
//! A round moves through its phases in strict order; any phase may abort.
//! Terminal states are sticky: once a round is `Done` or `Aborted` no
//! further transition is accepted.

use crate::miner::Uid;
use crate::outcome::ValidationOutcome;
use crate::response::TaskResponse;
use crate::task::TaskSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Init,
    Generating,
    Handshaking,
    Dispatching,
    Evaluating,
    Feedback,
    Cleanup,
    Settling,
    Done,
    Aborted,
}

impl RoundPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundPhase::Done | RoundPhase::Aborted)
    }

    /// The single legal successor in the happy path.
    fn next(&self) -> Option<RoundPhase> {
        match self {
            RoundPhase::Init => Some(RoundPhase::Generating),
            RoundPhase::Generating => Some(RoundPhase::Handshaking),
            RoundPhase::Handshaking => Some(RoundPhase::Dispatching),
            RoundPhase::Dispatching => Some(RoundPhase::Evaluating),
            RoundPhase::Evaluating => Some(RoundPhase::Feedback),
            RoundPhase::Feedback => Some(RoundPhase::Cleanup),
            RoundPhase::Cleanup => Some(RoundPhase::Settling),
            RoundPhase::Settling => Some(RoundPhase::Done),
            RoundPhase::Done | RoundPhase::Aborted => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Init => "init",
            RoundPhase::Generating => "generating",
            RoundPhase::Handshaking => "handshaking",
            RoundPhase::Dispatching => "dispatching",
            RoundPhase::Evaluating => "evaluating",
            RoundPhase::Feedback => "feedback",
            RoundPhase::Cleanup => "cleanup",
            RoundPhase::Settling => "settling",
            RoundPhase::Done => "done",
            RoundPhase::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoundError {
    #[error("illegal phase transition {from:?} -> {to:?}")]
    IllegalTransition { from: RoundPhase, to: RoundPhase },
    #[error("round {0} is already terminal")]
    Terminal(String),
}

/// All state owned by one round. Created by the round gate, mutated only by
/// the orchestrator, dropped after settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: String,
    pub start_block: u64,
    pub epoch: u64,
    pub phase: RoundPhase,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub active_uids: Vec<Uid>,
    /// uid -> task_id -> response.
    #[serde(default)]
    pub responses: HashMap<Uid, HashMap<String, TaskResponse>>,
    /// uid -> task_id -> validation outcome.
    #[serde(default)]
    pub outcomes: HashMap<Uid, HashMap<String, ValidationOutcome>>,
    /// uid -> combined final score for the round.
    #[serde(default)]
    pub final_scores: HashMap<Uid, f64>,
}

impl Round {
    pub fn new(round_id: impl Into<String>, start_block: u64, tempo: u64) -> Self {
        let epoch = if tempo > 0 { start_block / tempo } else { 0 };
        Self {
            round_id: round_id.into(),
            start_block,
            epoch,
            phase: RoundPhase::Init,
            tasks: Vec::new(),
            active_uids: Vec::new(),
            responses: HashMap::new(),
            outcomes: HashMap::new(),
            final_scores: HashMap::new(),
        }
    }

    /// Advance to the next phase in strict order.
    pub fn advance(&mut self, to: RoundPhase) -> Result<(), RoundError> {
        if self.phase.is_terminal() {
            return Err(RoundError::Terminal(self.round_id.clone()));
        }
        if self.phase.next() == Some(to) {
            self.phase = to;
            return Ok(());
        }
        Err(RoundError::IllegalTransition { from: self.phase, to })
    }

    /// Abort from any non-terminal phase.
    pub fn abort(&mut self) -> Result<(), RoundError> {
        if self.phase.is_terminal() {
            return Err(RoundError::Terminal(self.round_id.clone()));
        }
        self.phase = RoundPhase::Aborted;
        Ok(())
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.task_id.clone()).collect()
    }
}
