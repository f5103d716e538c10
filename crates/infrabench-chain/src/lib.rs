//! Chain substrate seam for the InfraBench validator.
//!
//! The validator reads three things from the chain: the current block, the
//! subnet tempo, and the miner table. Everything else (wallets, consensus,
//! actual weight extrinsics) lives behind the `ChainClient` and
//! `WeightEmitter` traits so the orchestration engine can run against a
//! mock chain in tests and local development.

pub mod clock;
pub mod ema;
pub mod metagraph;
pub mod rpc;

pub use clock::{epoch_of, epoch_progress, slot_index_for, ChainClient, ChainError, MockChain};
pub use ema::{normalize_positive_scores, NoopWeightEmitter, ScoreBook, WeightEmitter};
pub use metagraph::MetagraphCache;
pub use rpc::HttpChainClient;
