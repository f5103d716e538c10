//! End-to-end round orchestration against mock collaborators.
//!
//! Each test drives `ValidatorService::tick` through a full round with a
//! scripted chain, transport, task source, and sandbox, then asserts on
//! scores, ledger events, and wire payloads.

use infrabench_chain::MockChain;
use infrabench_protocol::{
    CleanupReply, FeedbackReply, HandshakeReply, MinerReply, MinerRequest, MockTransport,
    TaskReply,
};
use infrabench_sandbox::{MockSandboxApi, SandboxApi, SandboxError};
use infrabench_types::{CanonicalTask, Invariant, MinerIdentity, TaskParams, TaskSpec, Uid};
use infrabench_validator::config::{Config, LoopMode};
use infrabench_validator::generation::ScriptedTaskSource;
use infrabench_validator::service::{ServiceDeps, ValidatorService};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    service: ValidatorService,
    chain: Arc<MockChain>,
    transport: Arc<MockTransport>,
    sandbox: Arc<MockSandboxApi>,
    source: Arc<ScriptedTaskSource>,
    emitter: Arc<CountingEmitter>,
    dirs: tempfile::TempDir,
}

/// Emitter that records every emission it receives.
#[derive(Default)]
struct CountingEmitter {
    emissions: parking_lot::Mutex<Vec<(Vec<Uid>, Vec<f64>)>>,
}

#[async_trait::async_trait]
impl infrabench_chain::WeightEmitter for CountingEmitter {
    async fn emit(&self, uids: &[Uid], weights: &[f64]) -> Result<(), String> {
        self.emissions.lock().push((uids.to_vec(), weights.to_vec()));
        Ok(())
    }
}

fn harness(mutate: impl FnOnce(&mut Config)) -> Harness {
    let dirs = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.gate.loop_mode = LoopMode::Epoch;
    config.gate.skip_round_if_started_after_fraction = 0.95;
    config.concurrency.miner_concurrency = 8;
    config.timeouts.handshake_timeout_seconds = 5.0;
    config.timeouts.task_timeout_seconds = 60.0;
    config.timeouts.miner_response_timeout_seconds = 10.0;
    config.tasks.taskgen_retry_sleep_s = 0.0;
    config.settlement.ema_alpha = 1.0;
    config.persistence.checkpoint_dir = dirs.path().join("checkpoints");
    config.persistence.ledger_dir = dirs.path().join("ledger");
    config.persistence.round_summary_dir = dirs.path().join("ledger/rounds");
    mutate(&mut config);
    let config = config.validate().unwrap();

    let chain = Arc::new(MockChain::new(360));
    let transport = Arc::new(MockTransport::new());
    let sandbox = Arc::new(MockSandboxApi::new());
    let source = Arc::new(ScriptedTaskSource::new());

    let sandbox_api: Option<Arc<dyn SandboxApi>> = if config.validation.enabled {
        Some(sandbox.clone() as Arc<dyn SandboxApi>)
    } else {
        None
    };
    let emitter = Arc::new(CountingEmitter::default());
    let service = ValidatorService::new(
        config,
        ServiceDeps {
            chain: chain.clone(),
            transport: transport.clone(),
            task_source: source.clone(),
            sandbox_api,
            weight_emitter: Some(emitter.clone()),
            hotkey: Some("hk-validator".to_string()),
        },
    );
    Harness { service, chain, transport, sandbox, source, emitter, dirs }
}

fn miner(uid: Uid) -> MinerIdentity {
    MinerIdentity {
        uid,
        ip: format!("10.0.0.{}", uid + 1),
        port: 9000,
        hotkey: format!("hk-{uid}"),
    }
}

fn task_spec(task_id: &str, secret_value: &str) -> TaskSpec {
    TaskSpec {
        task_id: task_id.to_string(),
        provider: "gcp".to_string(),
        kind: "compute_instance".to_string(),
        prompt: Some("Provision a small VM in us-central1.".to_string()),
        params: TaskParams {
            task: Some(CanonicalTask {
                task_id: task_id.to_string(),
                invariants: vec![Invariant {
                    resource_type: "google_compute_instance".to_string(),
                    matchers: BTreeMap::from([(
                        "values.name".to_string(),
                        serde_json::json!(secret_value),
                    )]),
                }],
                ..Default::default()
            }),
            extra: BTreeMap::new(),
        },
        policy: Default::default(),
        verify_plan: Default::default(),
    }
}

fn invariantless_spec(task_id: &str) -> TaskSpec {
    let mut spec = task_spec(task_id, "unused");
    spec.params.task = None;
    spec
}

/// Route a well-behaved miner: ready handshake, echoing task reply with a
/// zip, acks for feedback and cleanup.
fn route_good_miner(transport: &MockTransport, uid: Uid) {
    transport.route(uid, move |request| match request {
        MinerRequest::Handshake(_) => Ok(MinerReply::Handshake(HandshakeReply {
            is_ready: true,
            miner_version: "0.1.0".to_string(),
            available_capacity: 2,
            error_message: None,
        })),
        MinerRequest::Task(task) => {
            let mut reply = TaskReply { task_id: task.task_id, ..Default::default() };
            reply.attach_workspace_zip(format!("zip-from-{uid}").as_bytes(), "workspace.zip");
            Ok(MinerReply::Task(reply))
        }
        MinerRequest::Feedback(_) => Ok(MinerReply::Feedback(FeedbackReply { acknowledged: true })),
        MinerRequest::Cleanup(_) => Ok(MinerReply::Cleanup(CleanupReply {
            acknowledged: true,
            cleanup_ok: true,
            error_message: None,
        })),
    });
}

fn ledger_events(harness: &Harness) -> Vec<Value> {
    let path = harness.service.ledger().path().to_path_buf();
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn events_named<'a>(events: &'a [Value], name: &str) -> Vec<&'a Value> {
    events.iter().filter(|e| e["event"] == name).collect()
}

fn latest_summary(harness: &Harness) -> Value {
    let path = harness.dirs.path().join("ledger/rounds/latest.json");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn summary_miner<'a>(summary: &'a Value, uid: Uid) -> &'a Value {
    summary["miners"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["uid"] == uid)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_single_task_two_miners_one_correct() {
    let mut h = harness(|_| {});
    h.chain.set_miners(vec![miner(5), miner(7)]);
    h.source.push(task_spec("t1", "vm-alpha"));
    route_good_miner(&h.transport, 5);
    route_good_miner(&h.transport, 7);
    // uid 5 is slow but correct; uid 7 fast but wrong.
    h.transport.delay(5, Duration::from_secs(2));
    h.transport.delay(7, Duration::from_secs(1));
    h.sandbox.set_handler(|request| {
        let uid = request.task_json["miner_uid"].as_i64().unwrap();
        Ok(MockSandboxApi::scored(if uid == 5 { 1.0 } else { 0.0 }))
    });

    h.service.startup().await.unwrap();
    let outcome = h.service.tick().await;
    assert!(outcome.started && outcome.completed && !outcome.aborted);

    let summary = latest_summary(&h);
    let m5 = summary_miner(&summary, 5);
    let m7 = summary_miner(&summary, 7);
    // Correct-but-slowest: 0.8 * 1.0 + 0.2 * ((1 - 1)^gamma) = 0.8.
    assert!((m5["final_score"].as_f64().unwrap() - 0.8).abs() < 1e-9);
    // Fail-closed: fast wrong answer scores zero.
    assert_eq!(m7["final_score"].as_f64().unwrap(), 0.0);

    // Settlement normalized the single positive score to weight 1.0.
    assert_eq!(summary["settlement"]["weights"]["5"].as_f64().unwrap(), 1.0);
    assert!(summary["settlement"]["weights"].get("7").is_none());
    assert_eq!(h.service.score_book().update_count(), 1);
    assert!((h.service.score_book().score(5) - 1.0).abs() < 1e-12);

    // The emission seam saw exactly one weight vector: all weight on uid 5.
    let emissions = h.emitter.emissions.lock();
    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0].0, vec![5]);
    assert!((emissions[0].1[0] - 1.0).abs() < 1e-12);
}

#[tokio::test(start_paused = true)]
async fn test_no_alive_miners_skips_round() {
    let mut h = harness(|_| {});
    h.chain.set_miners(vec![miner(1), miner(2)]);
    h.source.push(task_spec("t1", "vm-beta"));
    // uid 1 declines; uid 2 has no route (transport error).
    h.transport.route(1, |_| {
        Ok(MinerReply::Handshake(HandshakeReply {
            is_ready: false,
            error_message: Some("at capacity".to_string()),
            ..Default::default()
        }))
    });

    h.service.startup().await.unwrap();
    let outcome = h.service.tick().await;
    assert!(outcome.started && outcome.aborted && !outcome.completed);

    let events = ledger_events(&h);
    let handshakes = events_named(&events, "handshake_complete");
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0]["alive_uids"], serde_json::json!([]));
    assert!(events_named(&events, "dispatch_complete").is_empty());
    assert!(events_named(&events, "settlement_complete").is_empty());
    assert_eq!(h.service.score_book().update_count(), 0);
    assert!(h.emitter.emissions.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sandbox_503_then_success() {
    let mut h = harness(|c| c.validation.retries = 2);
    h.chain.set_miners(vec![miner(1)]);
    h.source.push(task_spec("t1", "vm-gamma"));
    route_good_miner(&h.transport, 1);
    h.sandbox.push_err(SandboxError::Unavailable);
    h.sandbox.push_ok(MockSandboxApi::scored(0.7));

    h.service.startup().await.unwrap();
    let outcome = h.service.tick().await;
    assert!(outcome.completed);

    let summary = latest_summary(&h);
    let validation = &summary_miner(&summary, 1)["tasks"][0]["validation"];
    assert_eq!(validation["status"], "validated");
    assert!((validation["api_score"].as_f64().unwrap() - 0.7).abs() < 1e-9);
    assert_eq!(validation["retries"], 1);
    // Single miner: latency score 1.0; final = 0.8*0.7 + 0.2.
    let final_score = summary_miner(&summary, 1)["final_score"].as_f64().unwrap();
    assert!((final_score - 0.76).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_empty_invariants_abort_round() {
    let mut h = harness(|c| c.tasks.taskgen_max_tries = 3);
    h.chain.set_miners(vec![miner(1)]);
    route_good_miner(&h.transport, 1);
    for i in 0..3 {
        h.source.push(invariantless_spec(&format!("t-bad-{i}")));
    }

    h.service.startup().await.unwrap();
    let outcome = h.service.tick().await;
    assert!(outcome.started && outcome.aborted);

    let events = ledger_events(&h);
    assert!(events_named(&events, "dispatch_complete").is_empty());
    let aborts = events_named(&events, "round_aborted");
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0]["phase"], "generating");
    // The transport never saw a single message.
    assert!(h.transport.sent_wire_payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_latency_tie_spread() {
    let mut h = harness(|_| {});
    h.chain.set_miners(vec![miner(1), miner(2), miner(3)]);
    h.source.push(task_spec("t1", "vm-delta"));
    for uid in 1..=3 {
        route_good_miner(&h.transport, uid);
    }
    h.transport.delay(1, Duration::from_micros(1000));
    h.transport.delay(2, Duration::from_micros(1500));
    h.transport.delay(3, Duration::from_micros(2000));
    h.sandbox.set_fallback(MockSandboxApi::scored(1.0));

    h.service.startup().await.unwrap();
    assert!(h.service.tick().await.completed);

    // Range 1ms <= eps 5ms: tie-spread ranks yield [1.0, 0.95, 0.90],
    // combined with weights (0.8, 0.2) -> [1.0, 0.99, 0.98].
    let summary = latest_summary(&h);
    let expect = [(1, 1.0), (2, 0.99), (3, 0.98)];
    for (uid, want) in expect {
        let got = summary_miner(&summary, uid)["final_score"].as_f64().unwrap();
        assert!((got - want).abs() < 1e-6, "uid {uid}: got {got}, want {want}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_mismatched_task_id_echo_is_zero_scored() {
    let mut h = harness(|_| {});
    h.chain.set_miners(vec![miner(1)]);
    h.source.push(task_spec("t1", "vm-epsilon"));
    h.transport.route(1, |request| match request {
        MinerRequest::Handshake(_) => Ok(MinerReply::Handshake(HandshakeReply {
            is_ready: true,
            ..Default::default()
        })),
        MinerRequest::Task(_) => {
            let mut reply = TaskReply { task_id: "t-other".to_string(), ..Default::default() };
            reply.attach_workspace_zip(b"zip", "workspace.zip");
            Ok(MinerReply::Task(reply))
        }
        MinerRequest::Feedback(_) => Ok(MinerReply::Feedback(FeedbackReply { acknowledged: true })),
        MinerRequest::Cleanup(_) => Ok(MinerReply::Cleanup(CleanupReply::default())),
    });
    h.sandbox.set_fallback(MockSandboxApi::scored(1.0));

    h.service.startup().await.unwrap();
    let outcome = h.service.tick().await;
    assert!(outcome.completed);

    let events = ledger_events(&h);
    let dispatch = events_named(&events, "dispatch_complete");
    assert_eq!(dispatch[0]["results"][0]["ack"], false);

    let summary = latest_summary(&h);
    let row = summary_miner(&summary, 1);
    assert_eq!(row["final_score"].as_f64().unwrap(), 0.0);
    assert_eq!(row["tasks"][0]["validation"]["status"], "no_response");
    assert_eq!(row["tasks"][0]["dispatch_failure"]["reason"], "task_id_mismatch");
    // No positive scores: settlement stays silent.
    assert!(events_named(&events, "settlement_complete").is_empty());
    assert_eq!(h.sandbox.submission_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wire_payloads_never_leak_invariants() {
    let mut h = harness(|_| {});
    h.chain.set_miners(vec![miner(1)]);
    h.source.push(task_spec("t1", "classified-vm-name-1234"));
    route_good_miner(&h.transport, 1);
    h.sandbox.set_handler(|_| {
        Ok(infrabench_sandbox::ValidateResponse {
            job_id: "job-1".to_string(),
            result: infrabench_sandbox::Verdict {
                status: "pass".to_string(),
                score: 1.0,
                msg: String::new(),
            },
            tap: Some("tap-internal-77".to_string()),
            ..Default::default()
        })
    });

    h.service.startup().await.unwrap();
    assert!(h.service.tick().await.completed);

    let payloads = h.transport.sent_wire_payloads();
    assert!(!payloads.is_empty());
    for (uid, wire) in &payloads {
        assert!(!wire.contains("invariant"), "uid {uid} payload leaked invariants: {wire}");
        assert!(
            !wire.contains("classified-vm-name-1234"),
            "uid {uid} payload leaked the hidden matcher value"
        );
        assert!(!wire.contains("tap-internal-77"), "uid {uid} payload leaked the sandbox tap");
    }
    // The cleanup message did carry the sanitized verdict.
    let cleanup = payloads.iter().find(|(_, w)| w.contains("cleanup")).unwrap();
    assert!(cleanup.1.contains("job-1"));
}

#[tokio::test(start_paused = true)]
async fn test_one_round_per_epoch_and_one_ema_update_each() {
    let mut h = harness(|_| {});
    h.chain.set_miners(vec![miner(1)]);
    h.chain.set_block(10);
    h.source.push(task_spec("t1", "vm-zeta"));
    h.source.push(task_spec("t2", "vm-eta"));
    route_good_miner(&h.transport, 1);
    h.sandbox.set_fallback(MockSandboxApi::scored(1.0));

    h.service.startup().await.unwrap();

    let first = h.service.tick().await;
    assert!(first.completed);
    assert_eq!(h.service.score_book().update_count(), 1);

    // Same epoch: the gate holds.
    h.chain.set_block(40);
    let second = h.service.tick().await;
    assert!(!second.started);
    assert_eq!(h.service.score_book().update_count(), 1);

    // Next epoch: a fresh round and exactly one more EMA update.
    h.chain.set_block(370);
    let third = h.service.tick().await;
    assert!(third.completed);
    assert_eq!(h.service.score_book().update_count(), 2);

    let events = ledger_events(&h);
    assert_eq!(events_named(&events, "round_start").len(), 2);
    assert_eq!(events_named(&events, "settlement_complete").len(), 2);
}
