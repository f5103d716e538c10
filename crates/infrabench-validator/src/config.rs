//! Environment-driven validator configuration.
//!
//! Every option is read from `INFRABENCH_*` environment variables at
//! startup. `Config::validate` clamps the handful of values with hard
//! operational limits (most notably the sandbox submission concurrency).

use infrabench_types::Uid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// How the main loop decides when to start rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Wall-clock cadence; local development default.
    Timed,
    /// On-chain epoch slotting; production default.
    Epoch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Process name used in ledger file naming.
    pub process_name: String,
    /// Subnet this validator serves.
    pub netuid: u16,
    /// Chain uid of this validator, if already registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
    /// Chain substrate REST endpoint.
    pub chain_endpoint: String,
    /// The validator loop is not concurrency-safe across rounds; anything
    /// other than 1 is clamped with a warning.
    pub num_concurrent_forwards: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub loop_mode: LoopMode,
    /// Timed mode: seconds between round starts; epoch mode: inter-tick
    /// sleep after a completed round.
    pub round_cadence_seconds: f64,
    /// Main loop granularity between gate checks.
    pub tick_seconds: f64,
    /// Round duration expressed in epochs.
    pub round_size_epochs: f64,
    pub safety_buffer_epochs: f64,
    /// Skip starting when this much of the epoch has already elapsed.
    pub skip_round_if_started_after_fraction: f64,
    pub one_round_per_epoch: bool,
    /// Stagger validators across the epoch in this many windows.
    pub epoch_slots: u32,
    /// Explicit slot override; otherwise derived from uid / hotkey hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_slot_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Outbound miner RPCs in flight (handshake, dispatch, feedback,
    /// cleanup all share this bound).
    pub miner_concurrency: usize,
    /// Concurrent sandbox submissions. Hard-capped at 4: the bundled
    /// sandbox instance is not reliable beyond that.
    pub validation_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Liveness probe deadline. Short: dead miners should be skipped fast.
    pub handshake_timeout_seconds: f64,
    /// Task call deadline. Long: miners may run a full Terraform apply.
    pub task_timeout_seconds: f64,
    /// Feedback/cleanup deadline.
    pub miner_response_timeout_seconds: f64,
    /// Heartbeat interval while dispatch calls are pending.
    pub dispatch_progress_log_interval_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub latency_scoring_enabled: bool,
    pub api_score_weight: f64,
    pub latency_score_weight: f64,
    /// Shaping exponent: latency_score = (1 - delta) ^ gamma.
    pub latency_score_gamma: f64,
    /// Observed-latency range at or below which tie-spread mode engages.
    pub latency_tie_epsilon_s: f64,
    /// Slowest miner in tie-spread mode gets 1 - penalty.
    pub latency_tie_penalty_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub tasks_per_round: usize,
    /// Pre-generation pool target; 0 disables pooling.
    pub pre_generated_tasks: usize,
    /// Attempts before giving up on producing one valid task.
    pub taskgen_max_tries: u32,
    pub taskgen_retry_sleep_s: f64,
    /// External task-content generator endpoint.
    pub generator_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub retries: u32,
    /// Abort startup when the service is unhealthy.
    pub fail_fast_on_startup: bool,
    pub require_token_ready: bool,
    pub require_sandbox_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Uid excluded from positive-score normalization.
    pub burn_uid: Uid,
    /// Minimum seconds between EMA updates; 0 disables the guard.
    pub weights_min_interval_seconds: f64,
    /// EMA weight of the newest round.
    pub ema_alpha: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub enable_checkpoint_system: bool,
    pub checkpoint_dir: PathBuf,
    pub ledger_enabled: bool,
    pub ledger_dir: PathBuf,
    pub round_summary_enabled: bool,
    pub round_summary_dir: PathBuf,
    pub metagraph_resync_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub gate: GateConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutConfig,
    pub scoring: ScoringConfig,
    pub tasks: TaskConfig,
    pub validation: ValidationConfig,
    pub settlement: SettlementConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                process_name: "validator".to_string(),
                netuid: 1,
                uid: None,
                chain_endpoint: "http://127.0.0.1:9944".to_string(),
                num_concurrent_forwards: 1,
            },
            gate: GateConfig {
                loop_mode: LoopMode::Epoch,
                round_cadence_seconds: 30.0,
                tick_seconds: 5.0,
                round_size_epochs: 1.0,
                safety_buffer_epochs: 0.02,
                skip_round_if_started_after_fraction: 0.3,
                one_round_per_epoch: true,
                epoch_slots: 1,
                epoch_slot_index: None,
            },
            concurrency: ConcurrencyConfig {
                miner_concurrency: 128,
                validation_concurrency: 4,
            },
            timeouts: TimeoutConfig {
                handshake_timeout_seconds: 5.0,
                task_timeout_seconds: 1800.0,
                miner_response_timeout_seconds: 10.0,
                dispatch_progress_log_interval_s: 30.0,
            },
            scoring: ScoringConfig {
                latency_scoring_enabled: true,
                api_score_weight: 0.8,
                latency_score_weight: 0.2,
                latency_score_gamma: 1.0,
                latency_tie_epsilon_s: 0.005,
                latency_tie_penalty_max: 0.1,
            },
            tasks: TaskConfig {
                tasks_per_round: 1,
                pre_generated_tasks: 0,
                taskgen_max_tries: 20,
                taskgen_retry_sleep_s: 1.0,
                generator_endpoint: "http://127.0.0.1:8810".to_string(),
            },
            validation: ValidationConfig {
                enabled: true,
                endpoint: "http://127.0.0.1:8888".to_string(),
                timeout_seconds: 300,
                retries: 2,
                fail_fast_on_startup: true,
                require_token_ready: true,
                require_sandbox_ready: false,
            },
            settlement: SettlementConfig {
                burn_uid: 0,
                weights_min_interval_seconds: 0.0,
                ema_alpha: 0.3,
            },
            persistence: PersistenceConfig {
                enable_checkpoint_system: true,
                checkpoint_dir: PathBuf::from("checkpoints"),
                ledger_enabled: true,
                ledger_dir: PathBuf::from("logs/ledger"),
                round_summary_enabled: true,
                round_summary_dir: PathBuf::from("logs/ledger/rounds"),
                metagraph_resync_seconds: 60.0,
            },
            logging: LoggingConfig { level: "info".to_string() },
        }
    }
}

const ENV_PREFIX: &str = "INFRABENCH_";

fn get<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(&format!("{ENV_PREFIX}{key}"))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn env_str(env: &HashMap<String, String>, key: &str, default: &str) -> String {
    get(env, key).map(str::to_string).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str, default: T) -> T {
    match get(env, key).map(str::parse::<T>) {
        Some(Ok(value)) => value,
        _ => default,
    }
}

fn env_bool(env: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match get(env, key) {
        Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&env)
    }

    /// Load from an explicit key/value map (tests use this directly).
    pub fn from_env_map(env: &HashMap<String, String>) -> Self {
        let d = Config::default();
        Self {
            node: NodeConfig {
                process_name: env_str(env, "PROCESS_NAME", &d.node.process_name),
                netuid: env_parse(env, "NETUID", d.node.netuid),
                uid: get(env, "VALIDATOR_UID").and_then(|v| v.parse().ok()),
                chain_endpoint: env_str(env, "CHAIN_ENDPOINT", &d.node.chain_endpoint),
                num_concurrent_forwards: env_parse(
                    env,
                    "NUM_CONCURRENT_FORWARDS",
                    d.node.num_concurrent_forwards,
                ),
            },
            gate: GateConfig {
                loop_mode: match env_str(env, "LOOP_MODE", "epoch").to_ascii_lowercase().as_str() {
                    "timed" => LoopMode::Timed,
                    _ => LoopMode::Epoch,
                },
                round_cadence_seconds: env_parse(
                    env,
                    "ROUND_CADENCE_SECONDS",
                    d.gate.round_cadence_seconds,
                ),
                tick_seconds: env_parse(env, "TICK_SECONDS", d.gate.tick_seconds),
                round_size_epochs: env_parse(env, "ROUND_SIZE_EPOCHS", d.gate.round_size_epochs),
                safety_buffer_epochs: env_parse(
                    env,
                    "SAFETY_BUFFER_EPOCHS",
                    d.gate.safety_buffer_epochs,
                ),
                skip_round_if_started_after_fraction: env_parse(
                    env,
                    "SKIP_ROUND_IF_STARTED_AFTER_FRACTION",
                    d.gate.skip_round_if_started_after_fraction,
                ),
                one_round_per_epoch: env_bool(
                    env,
                    "ONE_ROUND_PER_EPOCH",
                    d.gate.one_round_per_epoch,
                ),
                epoch_slots: env_parse(env, "EPOCH_SLOTS", d.gate.epoch_slots),
                epoch_slot_index: get(env, "EPOCH_SLOT_INDEX").and_then(|v| v.parse().ok()),
            },
            concurrency: ConcurrencyConfig {
                miner_concurrency: env_parse(
                    env,
                    "MINER_CONCURRENCY",
                    d.concurrency.miner_concurrency,
                ),
                validation_concurrency: env_parse(
                    env,
                    "VALIDATION_CONCURRENCY",
                    d.concurrency.validation_concurrency,
                ),
            },
            timeouts: TimeoutConfig {
                handshake_timeout_seconds: env_parse(
                    env,
                    "HANDSHAKE_TIMEOUT_SECONDS",
                    d.timeouts.handshake_timeout_seconds,
                ),
                task_timeout_seconds: env_parse(
                    env,
                    "TASK_TIMEOUT_SECONDS",
                    d.timeouts.task_timeout_seconds,
                ),
                miner_response_timeout_seconds: env_parse(
                    env,
                    "MINER_RESPONSE_TIMEOUT_SECONDS",
                    d.timeouts.miner_response_timeout_seconds,
                ),
                dispatch_progress_log_interval_s: env_parse(
                    env,
                    "DISPATCH_PROGRESS_LOG_INTERVAL_S",
                    d.timeouts.dispatch_progress_log_interval_s,
                ),
            },
            scoring: ScoringConfig {
                latency_scoring_enabled: env_bool(
                    env,
                    "LATENCY_SCORING_ENABLED",
                    d.scoring.latency_scoring_enabled,
                ),
                api_score_weight: env_parse(env, "API_SCORE_WEIGHT", d.scoring.api_score_weight),
                latency_score_weight: env_parse(
                    env,
                    "LATENCY_SCORE_WEIGHT",
                    d.scoring.latency_score_weight,
                ),
                latency_score_gamma: env_parse(
                    env,
                    "LATENCY_SCORE_GAMMA",
                    d.scoring.latency_score_gamma,
                ),
                latency_tie_epsilon_s: env_parse(
                    env,
                    "LATENCY_TIE_EPSILON_S",
                    d.scoring.latency_tie_epsilon_s,
                ),
                latency_tie_penalty_max: env_parse(
                    env,
                    "LATENCY_TIE_PENALTY_MAX",
                    d.scoring.latency_tie_penalty_max,
                ),
            },
            tasks: TaskConfig {
                tasks_per_round: env_parse(env, "TASKS_PER_ROUND", d.tasks.tasks_per_round),
                pre_generated_tasks: env_parse(
                    env,
                    "PRE_GENERATED_TASKS",
                    d.tasks.pre_generated_tasks,
                ),
                taskgen_max_tries: env_parse(env, "TASKGEN_MAX_TRIES", d.tasks.taskgen_max_tries),
                taskgen_retry_sleep_s: env_parse(
                    env,
                    "TASKGEN_RETRY_SLEEP_S",
                    d.tasks.taskgen_retry_sleep_s,
                ),
                generator_endpoint: env_str(
                    env,
                    "TASKGEN_ENDPOINT",
                    &d.tasks.generator_endpoint,
                ),
            },
            validation: ValidationConfig {
                enabled: env_bool(env, "VALIDATION_API_ENABLED", d.validation.enabled),
                endpoint: env_str(env, "VALIDATION_API_ENDPOINT", &d.validation.endpoint),
                timeout_seconds: env_parse(
                    env,
                    "VALIDATION_API_TIMEOUT",
                    d.validation.timeout_seconds,
                ),
                retries: env_parse(env, "VALIDATION_API_RETRIES", d.validation.retries),
                fail_fast_on_startup: env_bool(
                    env,
                    "FAIL_FAST_ON_VALIDATION_API",
                    d.validation.fail_fast_on_startup,
                ),
                require_token_ready: env_bool(
                    env,
                    "VALIDATION_REQUIRE_TOKEN",
                    d.validation.require_token_ready,
                ),
                require_sandbox_ready: env_bool(
                    env,
                    "VALIDATION_REQUIRE_SANDBOX",
                    d.validation.require_sandbox_ready,
                ),
            },
            settlement: SettlementConfig {
                burn_uid: env_parse(env, "BURN_UID", d.settlement.burn_uid),
                weights_min_interval_seconds: env_parse(
                    env,
                    "WEIGHTS_MIN_INTERVAL_SECONDS",
                    d.settlement.weights_min_interval_seconds,
                ),
                ema_alpha: env_parse(env, "EMA_ALPHA", d.settlement.ema_alpha),
            },
            persistence: PersistenceConfig {
                enable_checkpoint_system: env_bool(
                    env,
                    "ENABLE_CHECKPOINT_SYSTEM",
                    d.persistence.enable_checkpoint_system,
                ),
                checkpoint_dir: PathBuf::from(env_str(
                    env,
                    "CHECKPOINT_DIR",
                    &d.persistence.checkpoint_dir.to_string_lossy(),
                )),
                ledger_enabled: env_bool(env, "LEDGER_ENABLED", d.persistence.ledger_enabled),
                ledger_dir: PathBuf::from(env_str(
                    env,
                    "LEDGER_DIR",
                    &d.persistence.ledger_dir.to_string_lossy(),
                )),
                round_summary_enabled: env_bool(
                    env,
                    "ROUND_SUMMARY_ENABLED",
                    d.persistence.round_summary_enabled,
                ),
                round_summary_dir: PathBuf::from(env_str(
                    env,
                    "ROUND_SUMMARY_DIR",
                    &d.persistence.round_summary_dir.to_string_lossy(),
                )),
                metagraph_resync_seconds: env_parse(
                    env,
                    "METAGRAPH_RESYNC_SECONDS",
                    d.persistence.metagraph_resync_seconds,
                ),
            },
            logging: LoggingConfig { level: env_str(env, "LOG_LEVEL", &d.logging.level) },
        }
    }

    /// Clamp and sanity-check. Returns the effective configuration.
    pub fn validate(mut self) -> anyhow::Result<Self> {
        if self.node.num_concurrent_forwards != 1 {
            warn!(
                requested = self.node.num_concurrent_forwards,
                "validator loop is not concurrency-safe; clamping num_concurrent_forwards to 1"
            );
            self.node.num_concurrent_forwards = 1;
        }
        if self.concurrency.validation_concurrency > 4 {
            warn!(
                requested = self.concurrency.validation_concurrency,
                "sandbox instance supports at most 4 concurrent jobs; clamping"
            );
            self.concurrency.validation_concurrency = 4;
        }
        if self.concurrency.validation_concurrency == 0 {
            self.concurrency.validation_concurrency = 1;
        }
        if self.concurrency.miner_concurrency == 0 {
            anyhow::bail!("miner_concurrency must be greater than 0");
        }
        if self.gate.epoch_slots == 0 {
            self.gate.epoch_slots = 1;
        }
        if self.gate.tick_seconds < 0.25 {
            self.gate.tick_seconds = 0.25;
        }
        if self.tasks.tasks_per_round == 0 {
            anyhow::bail!("tasks_per_round must be greater than 0");
        }
        if self.tasks.taskgen_max_tries == 0 {
            self.tasks.taskgen_max_tries = 1;
        }
        if self.scoring.api_score_weight < 0.0 || self.scoring.latency_score_weight < 0.0 {
            anyhow::bail!("scoring weights must be non-negative");
        }
        if self.scoring.latency_score_gamma <= 0.0 {
            self.scoring.latency_score_gamma = 1.0;
        }
        self.scoring.latency_tie_penalty_max = self.scoring.latency_tie_penalty_max.clamp(0.0, 1.0);
        if self.validation.enabled && self.validation.endpoint.trim().is_empty() {
            anyhow::bail!("validation api enabled but endpoint is empty");
        }
        if !(0.0..=1.0).contains(&self.settlement.ema_alpha) {
            anyhow::bail!("ema_alpha must be in [0, 1]");
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!("invalid log level: {}", self.logging.level);
        }
        Ok(self)
    }

    /// Normalized (api, latency) weights. Degenerate weights collapse to
    /// api-only scoring.
    pub fn score_weights(&self) -> (f64, f64) {
        let api = self.scoring.api_score_weight.max(0.0);
        let lat = self.scoring.latency_score_weight.max(0.0);
        let total = api + lat;
        if total <= 0.0 {
            (1.0, 0.0)
        } else {
            (api / total, lat / total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("INFRABENCH_{k}"), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default().validate().unwrap();
        assert_eq!(config.concurrency.miner_concurrency, 128);
        assert_eq!(config.concurrency.validation_concurrency, 4);
        assert_eq!(config.gate.loop_mode, LoopMode::Epoch);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_env_map(&env(&[
            ("LOOP_MODE", "timed"),
            ("ROUND_CADENCE_SECONDS", "12.5"),
            ("MINER_CONCURRENCY", "16"),
            ("TASKS_PER_ROUND", "3"),
            ("BURN_UID", "0"),
            ("VALIDATION_API_ENABLED", "false"),
            ("EPOCH_SLOT_INDEX", "2"),
        ]));
        assert_eq!(config.gate.loop_mode, LoopMode::Timed);
        assert_eq!(config.gate.round_cadence_seconds, 12.5);
        assert_eq!(config.concurrency.miner_concurrency, 16);
        assert_eq!(config.tasks.tasks_per_round, 3);
        assert!(!config.validation.enabled);
        assert_eq!(config.gate.epoch_slot_index, Some(2));
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = Config::from_env_map(&env(&[
            ("MINER_CONCURRENCY", "lots"),
            ("API_SCORE_WEIGHT", ""),
        ]));
        assert_eq!(config.concurrency.miner_concurrency, 128);
        assert_eq!(config.scoring.api_score_weight, 0.8);
    }

    #[test]
    fn test_validation_concurrency_is_hard_capped() {
        let config = Config::from_env_map(&env(&[("VALIDATION_CONCURRENCY", "64")]))
            .validate()
            .unwrap();
        assert_eq!(config.concurrency.validation_concurrency, 4);
    }

    #[test]
    fn test_concurrent_forwards_clamped_to_one() {
        let config = Config::from_env_map(&env(&[("NUM_CONCURRENT_FORWARDS", "8")]))
            .validate()
            .unwrap();
        assert_eq!(config.node.num_concurrent_forwards, 1);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = Config::default();
        config.concurrency.miner_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.validation.endpoint = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_score_weights_normalize() {
        let mut config = Config::default();
        config.scoring.api_score_weight = 0.8;
        config.scoring.latency_score_weight = 0.2;
        let (api, lat) = config.score_weights();
        assert!((api - 0.8).abs() < 1e-12);
        assert!((lat - 0.2).abs() < 1e-12);

        config.scoring.api_score_weight = 0.0;
        config.scoring.latency_score_weight = 0.0;
        assert_eq!(config.score_weights(), (1.0, 0.0));
    }
}
