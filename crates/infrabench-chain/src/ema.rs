//! Rolling EMA score book and the weight emission seam.

use async_trait::async_trait;
use infrabench_types::Uid;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// Filter to positive, finite, non-burn scores among the active uids and
/// normalize them to sum to 1. Returns `None` when nothing qualifies, in
/// which case settlement is a no-op.
pub fn normalize_positive_scores(
    scores: &HashMap<Uid, f64>,
    active_uids: &[Uid],
    burn_uid: Uid,
) -> Option<(Vec<Uid>, Vec<f64>)> {
    let mut candidates: Vec<Uid> = active_uids
        .iter()
        .copied()
        .filter(|uid| *uid >= 0 && *uid != burn_uid)
        .collect();
    candidates.sort_unstable();
    candidates.dedup();

    let mut uids = Vec::new();
    let mut values = Vec::new();
    for uid in candidates {
        let score = scores.get(&uid).copied().unwrap_or(0.0);
        if score.is_finite() && score > 0.0 {
            uids.push(uid);
            values.push(score);
        }
    }
    let sum: f64 = values.iter().sum();
    if uids.is_empty() || sum <= 0.0 {
        return None;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
    Some((uids, values))
}

/// Pushes the round's normalized weights toward the chain. The real
/// implementation wraps the wallet extrinsic; tests count invocations.
#[async_trait]
pub trait WeightEmitter: Send + Sync {
    async fn emit(&self, uids: &[Uid], weights: &[f64]) -> Result<(), String>;
}

/// Exponential moving average over per-round normalized scores, kept across
/// rounds. `alpha` is the weight of the newest round.
pub struct ScoreBook {
    alpha: f64,
    scores: RwLock<HashMap<Uid, f64>>,
    updates: RwLock<u64>,
}

impl ScoreBook {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            scores: RwLock::new(HashMap::new()),
            updates: RwLock::new(0),
        }
    }

    /// Fold one round of normalized scores into the moving average. Uids
    /// absent from this round decay toward zero.
    pub fn update_scores(&self, normalized: &[f64], uids: &[Uid]) {
        debug_assert_eq!(normalized.len(), uids.len());
        let mut book = self.scores.write();
        let fresh: HashMap<Uid, f64> = uids.iter().copied().zip(normalized.iter().copied()).collect();

        for (uid, value) in book.iter_mut() {
            let target = fresh.get(uid).copied().unwrap_or(0.0);
            *value = self.alpha * target + (1.0 - self.alpha) * *value;
        }
        for (uid, target) in fresh {
            book.entry(uid).or_insert_with(|| self.alpha * target);
        }

        *self.updates.write() += 1;
        info!(uids = uids.len(), "rolling scores updated");
    }

    pub fn score(&self, uid: Uid) -> f64 {
        self.scores.read().get(&uid).copied().unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> HashMap<Uid, f64> {
        self.scores.read().clone()
    }

    /// Number of `update_scores` calls so far. One per settled round.
    pub fn update_count(&self) -> u64 {
        *self.updates.read()
    }

    /// Current EMA state as an emission-ready weight vector (positive
    /// entries only, normalized).
    pub fn weights(&self) -> Option<(Vec<Uid>, Vec<f64>)> {
        let book = self.scores.read();
        let mut uids: Vec<Uid> = book
            .iter()
            .filter(|(_, v)| v.is_finite() && **v > 0.0)
            .map(|(u, _)| *u)
            .collect();
        uids.sort_unstable();
        let values: Vec<f64> = uids.iter().map(|u| book[u]).collect();
        let sum: f64 = values.iter().sum();
        if uids.is_empty() || sum <= 0.0 {
            return None;
        }
        let normalized = values.into_iter().map(|v| v / sum).collect();
        Some((uids, normalized))
    }
}

impl std::fmt::Debug for ScoreBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreBook")
            .field("alpha", &self.alpha)
            .field("tracked", &self.scores.read().len())
            .finish()
    }
}

/// Emitter that only logs; used when weight emission is disabled.
pub struct NoopWeightEmitter;

#[async_trait]
impl WeightEmitter for NoopWeightEmitter {
    async fn emit(&self, uids: &[Uid], _weights: &[f64]) -> Result<(), String> {
        debug!(count = uids.len(), "weight emission disabled; skipping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_filters_and_sums_to_one() {
        let scores =
            HashMap::from([(0, 0.5), (1, 0.0), (2, 0.8), (3, -0.1), (4, f64::NAN), (5, 0.2)]);
        let active = vec![0, 1, 2, 3, 4, 5, -7];
        // uid 0 is the burn uid here.
        let (uids, weights) = normalize_positive_scores(&scores, &active, 0).unwrap();
        assert_eq!(uids, vec![2, 5]);
        let sum: f64 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((weights[0] - 0.8).abs() < 1e-12);
        assert!((weights[1] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_none_when_all_zero() {
        let scores = HashMap::from([(1, 0.0), (2, 0.0)]);
        assert!(normalize_positive_scores(&scores, &[1, 2], 0).is_none());
        assert!(normalize_positive_scores(&HashMap::new(), &[], 0).is_none());
    }

    #[test]
    fn test_ema_moves_toward_new_round() {
        let book = ScoreBook::new(0.3);
        book.update_scores(&[1.0], &[5]);
        assert!((book.score(5) - 0.3).abs() < 1e-12);
        book.update_scores(&[1.0], &[5]);
        assert!((book.score(5) - 0.51).abs() < 1e-12);
        assert_eq!(book.update_count(), 2);
    }

    #[test]
    fn test_ema_decays_absent_uids() {
        let book = ScoreBook::new(0.5);
        book.update_scores(&[1.0], &[5]);
        book.update_scores(&[1.0], &[7]);
        assert!((book.score(5) - 0.25).abs() < 1e-12);
        assert!((book.score(7) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weights_are_normalized() {
        let book = ScoreBook::new(1.0);
        book.update_scores(&[0.75, 0.25], &[1, 2]);
        let (uids, weights) = book.weights().unwrap();
        assert_eq!(uids, vec![1, 2]);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }
}
