//! InfraBench validator: round orchestration engine.
//!
//! One validator process runs a perpetual loop; each tick may start one
//! round. A round is a strict seven-phase pipeline:
//! generation → handshake → dispatch → evaluation → feedback → cleanup →
//! settlement. Miner failures and sandbox failures degrade individual
//! (miner, task) slots to zero scores; only wallet misconfiguration and a
//! failed fail-fast startup health check terminate the process.

pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod evaluation;
pub mod feedback;
pub mod gate;
pub mod generation;
pub mod handshake;
pub mod ledger;
pub mod service;
pub mod settlement;
pub mod summary;

pub use config::Config;
pub use service::{PhaseError, TickOutcome, ValidatorService};
