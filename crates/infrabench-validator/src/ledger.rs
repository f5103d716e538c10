//! Append-only JSONL round ledger.
//!
//! One file per validator process under `logs/ledger/<process_name>.jsonl`,
//! one JSON object per line: `{"ts": ..., "event": ..., ...payload}`.
//! Writes are strictly best-effort; telemetry must never fail a round. The
//! orchestrator never reads this file back at runtime.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub struct RoundLedger {
    enabled: bool,
    path: PathBuf,
    lock: Mutex<()>,
}

impl RoundLedger {
    pub fn new(dir: &Path, process_name: &str, enabled: bool) -> Self {
        let path = dir.join(format!("{process_name}.jsonl"));
        let enabled = if enabled {
            match std::fs::create_dir_all(dir) {
                Ok(()) => true,
                Err(e) => {
                    debug!("ledger directory unavailable, disabling ledger: {e}");
                    false
                }
            }
        } else {
            false
        };
        Self { enabled, path, lock: Mutex::new(()) }
    }

    /// A disabled ledger that swallows every event.
    pub fn disabled() -> Self {
        Self { enabled: false, path: PathBuf::new(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append one event. `payload` must be a JSON object; its fields are
    /// flattened next to `ts` and `event`.
    pub fn write(&self, event: &str, payload: Value) {
        if !self.enabled {
            return;
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut record = json!({ "ts": ts, "event": event });
        if let (Value::Object(target), Value::Object(fields)) = (&mut record, payload) {
            for (k, v) in fields {
                target.insert(k, v);
            }
        }
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };

        let _guard = self.lock.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            debug!(event, "ledger write failed (ignored): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RoundLedger::new(dir.path(), "validator", true);
        ledger.write("round_start", json!({"round_id": "r-1", "block": 720}));
        ledger.write("handshake_complete", json!({"round_id": "r-1", "alive_uids": [1, 2]}));

        let content = std::fs::read_to_string(ledger.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "round_start");
        assert_eq!(first["round_id"], "r-1");
        assert!(first["ts"].as_f64().unwrap() > 0.0);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["alive_uids"], json!([1, 2]));
    }

    #[test]
    fn test_disabled_ledger_writes_nothing() {
        let ledger = RoundLedger::disabled();
        ledger.write("round_start", json!({"round_id": "r-1"}));
        assert!(!ledger.is_enabled());
    }

    #[test]
    fn test_unwritable_directory_disables_quietly() {
        // A file in place of the directory makes create_dir_all fail.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("ledger");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let ledger = RoundLedger::new(&blocker, "validator", true);
        assert!(!ledger.is_enabled());
        // And writing is still a no-op rather than a panic.
        ledger.write("round_start", json!({}));
    }
}
