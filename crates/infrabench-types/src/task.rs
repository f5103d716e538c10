//! Task specification model.
//!
//! A `TaskSpec` is produced by the content generator and owned by the
//! validator for the lifetime of a round. The natural-language `prompt` is
//! the ONLY field that ever reaches a miner; the canonical task document
//! under `params.task` (including its invariants) stays validator-side and
//! is handed to the sandbox during evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single machine-checkable predicate over deployed infrastructure state.
///
/// Example:
/// ```json
/// { "resource_type": "google_compute_instance",
///   "match": { "values.name": "minimal-vm", "values.zone": "us-central1-a" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invariant {
    pub resource_type: String,
    #[serde(rename = "match", default)]
    pub matchers: BTreeMap<String, Value>,
}

/// Canonical validator-side task document.
///
/// This is the JSON the sandbox receives as `task_json`. Invariants live at
/// the top level because that is where the sandbox looks for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTask {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub invariants: Vec<Invariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl CanonicalTask {
    /// Serialize to the JSON value submitted to the sandbox, stamping the
    /// task id and miner uid the sandbox expects.
    pub fn to_submission_json(&self, task_id: &str, miner_uid: i64) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| Value::Null);
        if let Value::Object(ref mut map) = value {
            if self.task_id.is_empty() {
                map.insert("task_id".to_string(), Value::String(task_id.to_string()));
            }
            map.insert("miner_uid".to_string(), Value::from(miner_uid));
        }
        value
    }
}

/// Opaque generator parameters attached to a task.
///
/// `task` carries the canonical document with invariants. `extra` preserves
/// whatever else the generator emitted (engine, provider account, submit
/// requirements) without this crate needing to know the shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<CanonicalTask>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Declarative policy hints bundled with a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPolicy {
    #[serde(default)]
    pub description: String,
    #[serde(default = "TaskPolicy::default_max_cost")]
    pub max_cost: String,
    #[serde(default)]
    pub constraints: BTreeMap<String, Value>,
}

impl TaskPolicy {
    fn default_max_cost() -> String {
        "low".to_string()
    }
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            description: String::new(),
            max_cost: Self::default_max_cost(),
            constraints: BTreeMap::new(),
        }
    }
}

/// Descriptor of how the sandbox should verify a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyPlan {
    #[serde(default = "VerifyPlan::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

impl VerifyPlan {
    fn default_kind() -> String {
        "noop".to_string()
    }
}

impl Default for VerifyPlan {
    fn default() -> Self {
        Self { kind: Self::default_kind(), steps: Vec::new() }
    }
}

/// Full task specification as produced by the content generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub provider: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub params: TaskParams,
    #[serde(default)]
    pub policy: TaskPolicy,
    #[serde(default)]
    pub verify_plan: VerifyPlan,
}

impl TaskSpec {
    /// The hidden invariants for this task, if the generator attached a
    /// canonical document.
    pub fn invariants(&self) -> &[Invariant] {
        self.params
            .task
            .as_ref()
            .map(|t| t.invariants.as_slice())
            .unwrap_or(&[])
    }

    /// True when the task carries at least one invariant and is therefore
    /// verifiable by the sandbox.
    pub fn is_verifiable(&self) -> bool {
        !self.invariants().is_empty()
    }

    /// Prompt text trimmed for dispatch. Empty string when the generator
    /// produced no prompt.
    pub fn dispatch_prompt(&self) -> String {
        self.prompt
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .to_string()
    }
}
