//! Per-round checkpoint files.
//!
//! A snapshot is rewritten at every successful phase boundary and deleted
//! when the round reaches a terminal state. Restarted processes do NOT
//! auto-resume from checkpoints; the files exist for operator inspection
//! and are garbage-collected after 24 hours at startup.

use infrabench_types::{Round, RoundPhase, Uid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub round_id: String,
    pub phase: RoundPhase,
    pub timestamp: u64,
    pub task_count: usize,
    pub active_uids: Vec<Uid>,
    pub tasks_completed: usize,
    pub scores: HashMap<Uid, f64>,
}

impl Checkpoint {
    pub fn from_round(round: &Round) -> Self {
        Self {
            round_id: round.round_id.clone(),
            phase: round.phase,
            timestamp: unix_now(),
            task_count: round.tasks.len(),
            active_uids: round.active_uids.clone(),
            tasks_completed: round
                .outcomes
                .values()
                .map(|by_task| by_task.len())
                .sum(),
            scores: round.final_scores.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub struct CheckpointStore {
    dir: PathBuf,
    enabled: bool,
}

impl CheckpointStore {
    pub const MAX_AGE_SECONDS: u64 = 24 * 3600;

    pub fn new(dir: &Path, enabled: bool) -> Self {
        if enabled {
            if let Err(e) = std::fs::create_dir_all(dir) {
                error!("checkpoint directory unavailable: {e}");
            }
        }
        Self { dir: dir.to_path_buf(), enabled }
    }

    fn path_for(&self, round_id: &str) -> PathBuf {
        self.dir.join(format!("{round_id}.json"))
    }

    /// Write the snapshot for this round. Failures are logged, not fatal.
    pub fn save(&self, round: &Round) {
        if !self.enabled {
            return;
        }
        let checkpoint = Checkpoint::from_round(round);
        let path = self.path_for(&round.round_id);
        let result = serde_json::to_vec_pretty(&checkpoint)
            .map_err(CheckpointError::from)
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(CheckpointError::from));
        match result {
            Ok(()) => debug!(round_id = %round.round_id, phase = round.phase.as_str(), "checkpoint written"),
            Err(e) => error!(round_id = %round.round_id, "checkpoint write failed: {e}"),
        }
    }

    pub fn load(&self, round_id: &str) -> Option<Checkpoint> {
        let bytes = std::fs::read(self.path_for(round_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn delete(&self, round_id: &str) {
        let path = self.path_for(round_id);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                error!(round_id, "checkpoint delete failed: {e}");
            } else {
                debug!(round_id, "checkpoint deleted");
            }
        }
    }

    /// Delete checkpoints older than `MAX_AGE_SECONDS`. Returns how many
    /// were removed.
    pub fn gc_stale(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = unix_now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stale = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Checkpoint>(&bytes).ok())
                .map(|c| now.saturating_sub(c.timestamp) > Self::MAX_AGE_SECONDS)
                .unwrap_or(false);
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "stale checkpoints garbage-collected");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(id: &str) -> Round {
        let mut round = Round::new(id, 360, 360);
        round.active_uids = vec![1, 2];
        round.final_scores = HashMap::from([(1, 0.8)]);
        round
    }

    #[test]
    fn test_save_load_delete_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), true);
        let r = round("r-ckpt");
        store.save(&r);

        let loaded = store.load("r-ckpt").unwrap();
        assert_eq!(loaded.round_id, "r-ckpt");
        assert_eq!(loaded.phase, RoundPhase::Init);
        assert_eq!(loaded.active_uids, vec![1, 2]);
        assert_eq!(loaded.scores.get(&1), Some(&0.8));

        store.delete("r-ckpt");
        assert!(store.load("r-ckpt").is_none());
    }

    #[test]
    fn test_disabled_store_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), false);
        store.save(&round("r-off"));
        assert!(store.load("r-off").is_none());
    }

    #[test]
    fn test_gc_removes_only_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), true);
        store.save(&round("r-fresh"));

        let stale = Checkpoint {
            round_id: "r-old".to_string(),
            phase: RoundPhase::Dispatching,
            timestamp: unix_now() - CheckpointStore::MAX_AGE_SECONDS - 60,
            task_count: 1,
            active_uids: vec![],
            tasks_completed: 0,
            scores: HashMap::new(),
        };
        std::fs::write(
            dir.path().join("r-old.json"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        assert_eq!(store.gc_stale(), 1);
        assert!(store.load("r-fresh").is_some());
        assert!(store.load("r-old").is_none());
    }
}
