//! Metagraph cache with a timed resync throttle.
//!
//! The miner table is read-only during a round. The cache refreshes at most
//! once per `resync_interval`; a timestamp check is enough because only the
//! single-threaded orchestrator loop triggers resyncs.

use crate::clock::{ChainClient, ChainError};
use infrabench_types::{MinerIdentity, Uid};
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct MetagraphCache {
    netuid: u16,
    resync_interval: Duration,
    miners: RwLock<Vec<MinerIdentity>>,
    last_sync: RwLock<Option<Instant>>,
}

impl MetagraphCache {
    pub fn new(netuid: u16, resync_interval: Duration) -> Self {
        Self {
            netuid,
            resync_interval,
            miners: RwLock::new(Vec::new()),
            last_sync: RwLock::new(None),
        }
    }

    /// Refresh from the chain if the resync interval has elapsed (or the
    /// cache has never been filled). A failed refresh keeps serving the
    /// previous table.
    pub async fn maybe_resync(&self, chain: &dyn ChainClient) {
        let due = {
            let last = self.last_sync.read();
            match *last {
                Some(at) => at.elapsed() >= self.resync_interval,
                None => true,
            }
        };
        if !due {
            return;
        }
        match chain.metagraph(self.netuid).await {
            Ok(miners) => {
                debug!(count = miners.len(), netuid = self.netuid, "metagraph resynced");
                *self.miners.write() = miners;
                *self.last_sync.write() = Some(Instant::now());
            }
            Err(e) => {
                warn!(netuid = self.netuid, "metagraph resync failed: {e}");
            }
        }
    }

    /// Force a refresh regardless of the throttle. Startup uses this so the
    /// first round never runs against an empty table.
    pub async fn resync_now(&self, chain: &dyn ChainClient) -> Result<(), ChainError> {
        let miners = chain.metagraph(self.netuid).await?;
        *self.miners.write() = miners;
        *self.last_sync.write() = Some(Instant::now());
        Ok(())
    }

    pub fn miners(&self) -> Vec<MinerIdentity> {
        self.miners.read().clone()
    }

    /// Miners worth probing: registered endpoints only. Validators (which
    /// publish a zero endpoint) are excluded here.
    pub fn servable_miners(&self) -> Vec<MinerIdentity> {
        self.miners
            .read()
            .iter()
            .filter(|m| m.has_served_endpoint())
            .cloned()
            .collect()
    }

    pub fn get(&self, uid: Uid) -> Option<MinerIdentity> {
        self.miners.read().iter().find(|m| m.uid == uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.miners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.miners.read().is_empty()
    }
}
