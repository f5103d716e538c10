//! Settlement: fold the round's scores into the rolling EMA.
//!
//! Filters to active, non-negative, positive-scored uids (excluding the
//! burn uid), normalizes to sum 1, and applies exactly one EMA update per
//! round. A minimum-interval guard keeps local-dev loops from spamming
//! score updates.

use crate::ledger::RoundLedger;
use infrabench_chain::{normalize_positive_scores, ScoreBook};
use infrabench_types::Uid;
use serde_json::json;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SettlementResult {
    /// uid -> normalized weight applied this round; empty when settlement
    /// was a no-op.
    pub weights: HashMap<Uid, f64>,
    pub skipped_reason: Option<String>,
}

pub struct Settlement {
    burn_uid: Uid,
    min_interval_s: f64,
    last_update_at: Option<Instant>,
}

impl Settlement {
    pub fn new(burn_uid: Uid, min_interval_s: f64) -> Self {
        Self { burn_uid, min_interval_s, last_update_at: None }
    }

    pub async fn run(
        &mut self,
        round_id: &str,
        scores: &HashMap<Uid, f64>,
        active_uids: &[Uid],
        score_book: &ScoreBook,
        ledger: &RoundLedger,
    ) -> SettlementResult {
        info!(round_id, active = active_uids.len(), "settlement phase");
        ledger.write(
            "settlement_start",
            json!({
                "round_id": round_id,
                "active_uids": active_uids,
                "scores": scores
                    .iter()
                    .map(|(uid, s)| (uid.to_string(), *s))
                    .collect::<HashMap<String, f64>>(),
            }),
        );

        if active_uids.is_empty() {
            info!(round_id, "skipping settlement (no active miners)");
            return SettlementResult {
                weights: HashMap::new(),
                skipped_reason: Some("no_active_miners".to_string()),
            };
        }

        if self.min_interval_s > 0.0 {
            if let Some(at) = self.last_update_at {
                let since = at.elapsed().as_secs_f64();
                if since < self.min_interval_s {
                    info!(
                        round_id,
                        since_s = format!("{since:.1}"),
                        min_s = self.min_interval_s,
                        "skipping settlement (min interval not elapsed)"
                    );
                    return SettlementResult {
                        weights: HashMap::new(),
                        skipped_reason: Some("min_interval".to_string()),
                    };
                }
            }
        }

        let Some((uids, normalized)) =
            normalize_positive_scores(scores, active_uids, self.burn_uid)
        else {
            info!(round_id, "skipping settlement (no positive scores)");
            return SettlementResult {
                weights: HashMap::new(),
                skipped_reason: Some("no_positive_scores".to_string()),
            };
        };

        score_book.update_scores(&normalized, &uids);
        self.last_update_at = Some(Instant::now());

        let weights: HashMap<Uid, f64> =
            uids.iter().copied().zip(normalized.iter().copied()).collect();
        info!(round_id, uids = uids.len(), "rolling scores settled");
        ledger.write(
            "settlement_complete",
            json!({
                "round_id": round_id,
                "non_zero_count": uids.len(),
                "scores": weights
                    .iter()
                    .map(|(uid, w)| (uid.to_string(), *w))
                    .collect::<HashMap<String, f64>>(),
            }),
        );
        SettlementResult { weights, skipped_reason: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> ScoreBook {
        ScoreBook::new(1.0)
    }

    #[tokio::test]
    async fn test_normalizes_and_updates_once() {
        let mut settlement = Settlement::new(0, 0.0);
        let book = book();
        let scores = HashMap::from([(5, 0.8), (7, 0.0)]);
        let result = settlement
            .run("r-1", &scores, &[5, 7], &book, &RoundLedger::disabled())
            .await;
        assert!(result.skipped_reason.is_none());
        assert!((result.weights[&5] - 1.0).abs() < 1e-12);
        assert!(!result.weights.contains_key(&7));
        assert_eq!(book.update_count(), 1);
    }

    #[tokio::test]
    async fn test_no_active_miners_is_noop() {
        let mut settlement = Settlement::new(0, 0.0);
        let book = book();
        let result = settlement
            .run("r-1", &HashMap::new(), &[], &book, &RoundLedger::disabled())
            .await;
        assert_eq!(result.skipped_reason.as_deref(), Some("no_active_miners"));
        assert_eq!(book.update_count(), 0);
    }

    #[tokio::test]
    async fn test_all_zero_scores_is_noop() {
        let mut settlement = Settlement::new(0, 0.0);
        let book = book();
        let scores = HashMap::from([(1, 0.0), (2, 0.0)]);
        let result = settlement
            .run("r-1", &scores, &[1, 2], &book, &RoundLedger::disabled())
            .await;
        assert_eq!(result.skipped_reason.as_deref(), Some("no_positive_scores"));
        assert_eq!(book.update_count(), 0);
    }

    #[tokio::test]
    async fn test_burn_uid_is_excluded() {
        let mut settlement = Settlement::new(5, 0.0);
        let book = book();
        let scores = HashMap::from([(5, 0.9), (6, 0.3)]);
        let result = settlement
            .run("r-1", &scores, &[5, 6], &book, &RoundLedger::disabled())
            .await;
        assert!(!result.weights.contains_key(&5));
        assert!((result.weights[&6] - 1.0).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_guard() {
        let mut settlement = Settlement::new(0, 60.0);
        let book = book();
        let scores = HashMap::from([(1, 0.5)]);

        let first = settlement
            .run("r-1", &scores, &[1], &book, &RoundLedger::disabled())
            .await;
        assert!(first.skipped_reason.is_none());

        let second = settlement
            .run("r-2", &scores, &[1], &book, &RoundLedger::disabled())
            .await;
        assert_eq!(second.skipped_reason.as_deref(), Some("min_interval"));
        assert_eq!(book.update_count(), 1);

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        let third = settlement
            .run("r-3", &scores, &[1], &book, &RoundLedger::disabled())
            .await;
        assert!(third.skipped_reason.is_none());
        assert_eq!(book.update_count(), 2);
    }
}
