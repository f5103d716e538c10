//! Handshake probe: verify miner liveness before dispatch.
//!
//! Probing dead miners costs one short timeout here instead of one long
//! task timeout later. Any of {no reply, transport error, is_ready=false}
//! excludes the miner from the round.

use crate::ledger::RoundLedger;
use infrabench_protocol::{send_typed, HandshakeReply, HandshakeRequest, MinerTransport};
use infrabench_types::{MinerIdentity, Uid};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Extra grace on top of the configured probe timeout; the wrapping guard
/// must not fire before the transport's own deadline.
const GUARD_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    /// Uids that answered ready, ascending.
    pub alive_uids: Vec<Uid>,
    /// Reply (or None) per probed uid.
    pub replies: HashMap<Uid, Option<HandshakeReply>>,
    pub probed_uids: Vec<Uid>,
    pub duration_s: f64,
}

pub struct HandshakeProbe {
    transport: Arc<dyn MinerTransport>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl HandshakeProbe {
    pub fn new(
        transport: Arc<dyn MinerTransport>,
        semaphore: Arc<Semaphore>,
        timeout: Duration,
    ) -> Self {
        Self { transport, semaphore, timeout }
    }

    pub async fn run(
        &self,
        round_id: &str,
        candidates: &[MinerIdentity],
        ledger: &RoundLedger,
    ) -> HandshakeOutcome {
        let started = tokio::time::Instant::now();
        let request = HandshakeRequest {
            round_id: round_id.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        // Only miners that have served a real endpoint are probed;
        // validators publish a zero endpoint and never answer.
        let targets: Vec<MinerIdentity> = candidates
            .iter()
            .filter(|m| m.has_served_endpoint())
            .cloned()
            .collect();
        info!(
            round_id,
            probing = targets.len(),
            candidates = candidates.len(),
            timeout_s = self.timeout.as_secs_f64(),
            "handshake phase: verifying miner liveness"
        );

        let mut join_set: JoinSet<(Uid, Option<HandshakeReply>, f64)> = JoinSet::new();
        for miner in &targets {
            let transport = Arc::clone(&self.transport);
            let semaphore = Arc::clone(&self.semaphore);
            let request = request.clone();
            let miner = miner.clone();
            let deadline = self.timeout + GUARD_MARGIN;
            join_set.spawn(async move {
                let start = tokio::time::Instant::now();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (miner.uid, None, 0.0);
                };
                let result =
                    tokio::time::timeout(deadline, send_typed(transport.as_ref(), &miner, request))
                        .await;
                let latency = start.elapsed().as_secs_f64();
                match result {
                    Ok(Ok(reply)) => (miner.uid, Some(reply), latency),
                    Ok(Err(e)) => {
                        debug!(uid = miner.uid, "handshake error: {e}");
                        (miner.uid, None, latency)
                    }
                    Err(_) => {
                        debug!(uid = miner.uid, "handshake timed out after {latency:.2}s");
                        (miner.uid, None, latency)
                    }
                }
            });
        }

        let total = targets.len();
        let mut completed = 0usize;
        let mut replies: HashMap<Uid, Option<HandshakeReply>> = HashMap::new();
        let mut alive_uids: Vec<Uid> = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            let (uid, reply, latency) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("handshake task crashed: {e}");
                    continue;
                }
            };
            completed += 1;
            if completed == 1 || completed == total || completed % 5 == 0 {
                info!(round_id, completed, total, "handshake progress");
            }
            let is_alive = reply.as_ref().map(|r| r.is_ready).unwrap_or(false);
            if is_alive {
                let reply_ref = reply.as_ref().unwrap();
                debug!(
                    uid,
                    version = %reply_ref.miner_version,
                    capacity = reply_ref.available_capacity,
                    "miner alive | latency={latency:.2}s"
                );
                alive_uids.push(uid);
            } else {
                debug!(uid, "miner not ready | latency={latency:.2}s");
            }
            replies.insert(uid, reply);
        }
        alive_uids.sort_unstable();

        let duration_s = started.elapsed().as_secs_f64();
        info!(
            round_id,
            alive = alive_uids.len(),
            probed = total,
            duration_s = format!("{duration_s:.2}"),
            "handshake complete"
        );

        let probed_uids: Vec<Uid> = targets.iter().map(|m| m.uid).collect();
        ledger.write(
            "handshake_complete",
            json!({
                "round_id": round_id,
                "handshake_time_s": duration_s,
                "alive_uids": alive_uids,
                "queried_uids": probed_uids,
                "miners": targets
                    .iter()
                    .map(|m| {
                        let reply = replies.get(&m.uid).and_then(|r| r.as_ref());
                        json!({
                            "uid": m.uid,
                            "address": m.address(),
                            "hotkey": m.hotkey,
                            "is_alive": alive_uids.contains(&m.uid),
                            "miner_version": reply.map(|r| r.miner_version.clone()),
                            "available_capacity": reply.map(|r| r.available_capacity),
                            "error_message": reply.and_then(|r| r.error_message.clone()),
                        })
                    })
                    .collect::<Vec<_>>(),
            }),
        );

        HandshakeOutcome { alive_uids, replies, probed_uids, duration_s }
    }
}
