//! Chain clock access and epoch arithmetic.

use async_trait::async_trait;
use infrabench_types::{MinerIdentity, Uid};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain rpc failed: {0}")]
    Rpc(String),
    #[error("subnet {0} not found")]
    UnknownSubnet(u16),
}

/// Read-only view of the chain substrate.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_block(&self) -> Result<u64, ChainError>;
    /// Blocks per epoch for the subnet.
    async fn tempo(&self, netuid: u16) -> Result<u64, ChainError>;
    /// The full miner table, one entry per registered uid.
    async fn metagraph(&self, netuid: u16) -> Result<Vec<MinerIdentity>, ChainError>;
}

/// `current_block / tempo`. Tempo 0 collapses everything into epoch 0.
pub fn epoch_of(block: u64, tempo: u64) -> u64 {
    if tempo == 0 {
        return 0;
    }
    block / tempo
}

/// Fraction of the current epoch already elapsed, in [0, 1).
pub fn epoch_progress(block: u64, tempo: u64) -> f64 {
    if tempo == 0 {
        return 0.0;
    }
    (block % tempo) as f64 / tempo as f64
}

/// Deterministic slot index for this validator when round starts are
/// staggered across the epoch. Uses the chain uid when assigned, otherwise
/// a hash of the hotkey; a validator with neither lands in slot 0.
pub fn slot_index_for(uid: Option<Uid>, hotkey: Option<&str>, slot_count: u32) -> u32 {
    let slot_count = slot_count.max(1);
    if let Some(uid) = uid {
        if uid >= 0 {
            return (uid as u64 % slot_count as u64) as u32;
        }
    }
    match hotkey.filter(|h| !h.is_empty()) {
        Some(hotkey) => {
            let digest = Sha256::digest(hotkey.as_bytes());
            let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
            value % slot_count
        }
        None => 0,
    }
}

/// Scripted chain for tests and local development: block height and the
/// miner table are plain in-memory values the test advances by hand.
#[derive(Default)]
pub struct MockChain {
    block: Mutex<u64>,
    tempo: u64,
    miners: Mutex<Vec<MinerIdentity>>,
}

impl MockChain {
    pub fn new(tempo: u64) -> Self {
        Self { block: Mutex::new(0), tempo, miners: Mutex::new(Vec::new()) }
    }

    pub fn set_block(&self, block: u64) {
        *self.block.lock() = block;
    }

    pub fn advance(&self, blocks: u64) {
        *self.block.lock() += blocks;
    }

    pub fn set_miners(&self, miners: Vec<MinerIdentity>) {
        *self.miners.lock() = miners;
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(*self.block.lock())
    }

    async fn tempo(&self, _netuid: u16) -> Result<u64, ChainError> {
        Ok(self.tempo)
    }

    async fn metagraph(&self, _netuid: u16) -> Result<Vec<MinerIdentity>, ChainError> {
        Ok(self.miners.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_arithmetic() {
        assert_eq!(epoch_of(0, 360), 0);
        assert_eq!(epoch_of(359, 360), 0);
        assert_eq!(epoch_of(360, 360), 1);
        assert_eq!(epoch_of(725, 360), 2);
        assert_eq!(epoch_of(100, 0), 0);
    }

    #[test]
    fn test_epoch_progress() {
        assert_eq!(epoch_progress(0, 360), 0.0);
        assert!((epoch_progress(180, 360) - 0.5).abs() < 1e-12);
        assert!(epoch_progress(359, 360) < 1.0);
        assert_eq!(epoch_progress(7, 0), 0.0);
    }

    #[test]
    fn test_slot_index_prefers_uid() {
        assert_eq!(slot_index_for(Some(7), Some("hk"), 4), 3);
        assert_eq!(slot_index_for(Some(8), None, 4), 0);
    }

    #[test]
    fn test_slot_index_hotkey_fallback_is_deterministic() {
        let a = slot_index_for(None, Some("validator-hotkey"), 6);
        let b = slot_index_for(None, Some("validator-hotkey"), 6);
        assert_eq!(a, b);
        assert!(a < 6);
        // Negative (local-test) uids also fall back to the hotkey.
        assert_eq!(slot_index_for(Some(-1), Some("validator-hotkey"), 6), a);
    }

    #[test]
    fn test_slot_index_without_identity_is_zero() {
        assert_eq!(slot_index_for(None, None, 8), 0);
        assert_eq!(slot_index_for(None, Some(""), 8), 0);
    }

    #[tokio::test]
    async fn test_mock_chain_advances() {
        let chain = MockChain::new(360);
        chain.set_block(100);
        chain.advance(20);
        assert_eq!(chain.current_block().await.unwrap(), 120);
        assert_eq!(chain.tempo(1).await.unwrap(), 360);
    }
}
