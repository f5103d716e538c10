//! Task generation facade.
//!
//! The actual content generator (template catalog + LLM prompt rendering)
//! is an external collaborator behind the `TaskSource` trait. This facade
//! enforces the one rule the orchestrator cares about (every dispatched
//! task must carry a non-empty hidden invariant list) and maintains the
//! optional pre-generation pool that amortizes generation latency across
//! rounds.
//!
//! For each selected task the facade remembers the canonical task JSON
//! keyed by (round_id, task_id). The evaluator uses only this remembered
//! document; invariants appearing in miner-controlled payloads are never
//! trusted.

use crate::config::TaskConfig;
use crate::ledger::RoundLedger;
use async_trait::async_trait;
use infrabench_types::TaskSpec;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no valid task after {tries} attempts: {last}")]
    Exhausted { tries: u32, last: String },
}

/// External task-content generator seam.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn generate(&self) -> anyhow::Result<TaskSpec>;
}

pub struct TaskGenerator {
    source: Arc<dyn TaskSource>,
    config: TaskConfig,
    ledger: Arc<RoundLedger>,
    pool: Mutex<Vec<TaskSpec>>,
    /// round_id -> task_id -> canonical task JSON (top-level invariants).
    canonical: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl TaskGenerator {
    pub fn new(source: Arc<dyn TaskSource>, config: TaskConfig, ledger: Arc<RoundLedger>) -> Self {
        Self {
            source,
            config,
            ledger,
            pool: Mutex::new(Vec::new()),
            canonical: Mutex::new(HashMap::new()),
        }
    }

    /// Produce the task list for a round. Aborts the round (via error) when
    /// the generator cannot produce a verifiable task within its retry
    /// budget.
    pub async fn generate_round_tasks(
        &self,
        round_id: &str,
        n: usize,
    ) -> Result<Vec<TaskSpec>, GenerationError> {
        let mut tasks = Vec::with_capacity(n);

        if self.config.pre_generated_tasks > 0 {
            let mut pool = self.pool.lock();
            while tasks.len() < n {
                match pool.pop() {
                    Some(task) => tasks.push(task),
                    None => break,
                }
            }
            drop(pool);
            debug!(
                round_id,
                pulled = tasks.len(),
                remaining = self.pool_len(),
                "pulled tasks from pre-generation pool"
            );
        }

        while tasks.len() < n {
            let task = self.generate_one_valid().await?;
            tasks.push(task);
        }

        for task in &tasks {
            self.remember(round_id, task);
        }

        self.ledger.write(
            "round_tasks_selected",
            json!({
                "round_id": round_id,
                "pool_remaining": self.pool_len(),
                "tasks": tasks
                    .iter()
                    .map(|t| json!({
                        "task_id": t.task_id,
                        "provider": t.provider,
                        "kind": t.kind,
                        "prompt": t.prompt,
                        "invariant_count": t.invariants().len(),
                    }))
                    .collect::<Vec<_>>(),
            }),
        );
        info!(round_id, count = tasks.len(), "round tasks selected");
        Ok(tasks)
    }

    /// One generation attempt loop: retry until the source yields a task
    /// with at least one invariant.
    async fn generate_one_valid(&self) -> Result<TaskSpec, GenerationError> {
        let max_tries = self.config.taskgen_max_tries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_tries {
            match self.source.generate().await {
                Ok(task) if task.is_verifiable() => {
                    debug!(task_id = %task.task_id, attempt, "task generated");
                    return Ok(task);
                }
                Ok(task) => {
                    last_error = format!(
                        "task {} has no invariants; refusing to dispatch an unverifiable task",
                        task.task_id
                    );
                    warn!(attempt, max_tries, "{last_error}");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt, max_tries, "task generation attempt failed: {last_error}");
                }
            }
            if attempt < max_tries && self.config.taskgen_retry_sleep_s > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(self.config.taskgen_retry_sleep_s))
                    .await;
            }
        }
        Err(GenerationError::Exhausted { tries: max_tries, last: last_error })
    }

    /// Top the pool back up to its target. Invoked in the background after
    /// each round when pooling is enabled; safe to call repeatedly.
    pub async fn refill_pool(&self) {
        let target = self.config.pre_generated_tasks;
        if target == 0 {
            return;
        }
        let healthy = (target / 2).max(1);
        if self.pool_len() >= healthy {
            return;
        }

        let mut generated = 0usize;
        while self.pool_len() < target {
            match self.generate_one_valid().await {
                Ok(task) => {
                    self.ledger.write(
                        "task_generated",
                        json!({
                            "task_id": task.task_id,
                            "provider": task.provider,
                            "kind": task.kind,
                            "invariant_count": task.invariants().len(),
                        }),
                    );
                    self.pool.lock().push(task);
                    generated += 1;
                }
                Err(e) => {
                    warn!("task pool refill stopped: {e}");
                    break;
                }
            }
        }
        if generated > 0 {
            info!(generated, pool = self.pool_len(), target, "task pool refilled");
        }
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().len()
    }

    fn remember(&self, round_id: &str, task: &TaskSpec) {
        let Some(canonical) = task.params.task.as_ref() else {
            return;
        };
        let value = canonical.to_submission_json(&task.task_id, -1);
        // miner_uid is stamped per-submission later; drop the placeholder.
        let value = match value {
            Value::Object(mut map) => {
                map.remove("miner_uid");
                Value::Object(map)
            }
            other => other,
        };
        self.canonical
            .lock()
            .entry(round_id.to_string())
            .or_default()
            .insert(task.task_id.clone(), value);
    }

    /// The remembered validator-side task JSON for (round_id, task_id).
    pub fn canonical_task_json(&self, round_id: &str, task_id: &str) -> Option<Value> {
        self.canonical.lock().get(round_id)?.get(task_id).cloned()
    }

    /// Drop all per-round memory once the round is terminal.
    pub fn clear_round(&self, round_id: &str) {
        self.canonical.lock().remove(round_id);
    }
}

/// HTTP seam to the external task-content generator service.
///
/// `POST {endpoint}/generate` returns one fully-formed task spec with the
/// canonical document (prompt, invariants, verify plan) already attached.
pub struct HttpTaskSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTaskSource {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, endpoint: endpoint.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl TaskSource for HttpTaskSource {
    async fn generate(&self) -> anyhow::Result<TaskSpec> {
        let url = format!("{}/generate", self.endpoint);
        let response = self.client.post(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("task generator returned {status}");
        }
        Ok(response.json::<TaskSpec>().await?)
    }
}

/// Queue-backed source for tests and local development: plays back scripted
/// specs, then errors out.
#[derive(Default)]
pub struct ScriptedTaskSource {
    queue: Mutex<VecDeque<anyhow::Result<TaskSpec>>>,
    calls: Mutex<u32>,
}

impl ScriptedTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: TaskSpec) {
        self.queue.lock().push_back(Ok(task));
    }

    pub fn push_error(&self, message: &str) {
        self.queue.lock().push_back(Err(anyhow::anyhow!(message.to_string())));
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl TaskSource for ScriptedTaskSource {
    async fn generate(&self) -> anyhow::Result<TaskSpec> {
        *self.calls.lock() += 1;
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("task source exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrabench_types::{CanonicalTask, Invariant, TaskParams};
    use std::collections::BTreeMap;

    pub(crate) fn verifiable_task(task_id: &str) -> TaskSpec {
        TaskSpec {
            task_id: task_id.to_string(),
            provider: "gcp".to_string(),
            kind: "storage_bucket".to_string(),
            prompt: Some(format!("Provision resources for {task_id}.")),
            params: TaskParams {
                task: Some(CanonicalTask {
                    task_id: task_id.to_string(),
                    invariants: vec![Invariant {
                        resource_type: "google_storage_bucket".to_string(),
                        matchers: BTreeMap::new(),
                    }],
                    ..Default::default()
                }),
                extra: BTreeMap::new(),
            },
            policy: Default::default(),
            verify_plan: Default::default(),
        }
    }

    fn bare_task(task_id: &str) -> TaskSpec {
        let mut task = verifiable_task(task_id);
        task.params.task = None;
        task
    }

    fn config(pool: usize, tries: u32) -> TaskConfig {
        TaskConfig {
            tasks_per_round: 1,
            pre_generated_tasks: pool,
            taskgen_max_tries: tries,
            taskgen_retry_sleep_s: 0.0,
            generator_endpoint: String::new(),
        }
    }

    fn generator(source: Arc<ScriptedTaskSource>, cfg: TaskConfig) -> TaskGenerator {
        TaskGenerator::new(source, cfg, Arc::new(RoundLedger::disabled()))
    }

    #[tokio::test]
    async fn test_generates_and_remembers_canonical_json() {
        let source = Arc::new(ScriptedTaskSource::new());
        source.push(verifiable_task("t-1"));
        let gen = generator(source, config(0, 3));

        let tasks = gen.generate_round_tasks("r-1", 1).await.unwrap();
        assert_eq!(tasks.len(), 1);
        let canonical = gen.canonical_task_json("r-1", "t-1").unwrap();
        assert_eq!(canonical["task_id"], "t-1");
        assert_eq!(canonical["invariants"].as_array().unwrap().len(), 1);
        assert!(canonical.get("miner_uid").is_none());

        gen.clear_round("r-1");
        assert!(gen.canonical_task_json("r-1", "t-1").is_none());
    }

    #[tokio::test]
    async fn test_retries_past_invariantless_tasks() {
        let source = Arc::new(ScriptedTaskSource::new());
        source.push(bare_task("t-bad"));
        source.push_error("generator hiccup");
        source.push(verifiable_task("t-good"));
        let gen = generator(source.clone(), config(0, 5));

        let tasks = gen.generate_round_tasks("r-1", 1).await.unwrap();
        assert_eq!(tasks[0].task_id, "t-good");
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_round() {
        let source = Arc::new(ScriptedTaskSource::new());
        for _ in 0..4 {
            source.push(bare_task("t-bad"));
        }
        let gen = generator(source.clone(), config(0, 3));

        let err = gen.generate_round_tasks("r-1", 1).await.unwrap_err();
        assert!(matches!(err, GenerationError::Exhausted { tries: 3, .. }));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_pool_refill_and_pull() {
        let source = Arc::new(ScriptedTaskSource::new());
        for i in 0..4 {
            source.push(verifiable_task(&format!("t-{i}")));
        }
        let gen = generator(source, config(3, 2));

        gen.refill_pool().await;
        assert_eq!(gen.pool_len(), 3);

        let tasks = gen.generate_round_tasks("r-1", 2).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(gen.pool_len(), 1);
        // Both pulled tasks are remembered for evaluation.
        for task in &tasks {
            assert!(gen.canonical_task_json("r-1", &task.task_id).is_some());
        }
    }

    #[tokio::test]
    async fn test_pool_miss_falls_back_to_on_demand() {
        let source = Arc::new(ScriptedTaskSource::new());
        source.push(verifiable_task("t-direct"));
        // Pool enabled but empty: the round still gets its task.
        let gen = generator(source, config(5, 2));
        let tasks = gen.generate_round_tasks("r-1", 1).await.unwrap();
        assert_eq!(tasks[0].task_id, "t-direct");
    }
}
