/// Integration tests for the execution engine: scheduling, concurrency
/// bounds, retry/fallback policy, failure propagation, and cancellation.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use maestro_core::{
    Action, CallStatus, CancelToken, EngineDefaults, EngineError, ExecutionEngine, ExecutionMode,
    ExecutionPlan, Hub, Registry, RetryPolicy, ToolCall, DEPS_PARAM_KEY,
};

// ============================================================================
// Test fixtures
// ============================================================================

/// Shared instrumentation for a test hub: per-action invocation counts and
/// an ordered start/end event log.
#[derive(Default)]
struct Probe {
    events: Mutex<Vec<(String, &'static str)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Probe {
    fn record(&self, name: &str, event: &'static str) {
        self.events.lock().push((name.to_string(), event));
    }

    fn count(&self, name: &str, event: &'static str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(n, e)| n == name && *e == event)
            .count()
    }

    fn starts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| *e == "start")
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// True when every "end" event for `dep` precedes the first "start"
    /// event for `name`.
    fn ended_before_start(&self, dep: &str, name: &str) -> bool {
        let events = self.events.lock();
        let first_start = events.iter().position(|(n, e)| n == name && *e == "start");
        let last_end = events.iter().rposition(|(n, e)| n == dep && *e == "end");
        match (last_end, first_start) {
            (Some(end), Some(start)) => end < start,
            _ => false,
        }
    }

    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An action that records start/end, sleeps briefly, and echoes its name.
fn tracked_action(probe: Arc<Probe>, name: &str, sleep_ms: u64) -> Action {
    let id = name.to_string();
    Action::from_fn(name, "tracked test action", move |params| {
        let probe = probe.clone();
        let id = id.clone();
        async move {
            probe.record(&id, "start");
            probe.enter();
            if sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
            probe.exit();
            probe.record(&id, "end");
            Ok(json!({ "action": id, "params": params }))
        }
    })
}

/// An action that fails until it has been invoked `fail_times` times.
fn flaky_action(probe: Arc<Probe>, name: &str, fail_times: usize) -> Action {
    let id = name.to_string();
    let calls = Arc::new(AtomicUsize::new(0));
    Action::from_fn(name, "flaky test action", move |_params| {
        let probe = probe.clone();
        let id = id.clone();
        let calls = calls.clone();
        async move {
            probe.record(&id, "start");
            let n = calls.fetch_add(1, Ordering::SeqCst);
            probe.record(&id, "end");
            if n < fail_times {
                anyhow::bail!("induced failure {n}")
            }
            Ok(json!("recovered"))
        }
    })
}

fn engine_with(hub: Hub) -> (Arc<Registry>, ExecutionEngine) {
    let registry = Arc::new(Registry::new("test", "test registry"));
    registry.register(hub);
    let engine = ExecutionEngine::new(registry.clone());
    (registry, engine)
}

fn call(id: &str, action: &str) -> ToolCall {
    ToolCall::new(id, action)
}

// ============================================================================
// Result shape and ordering
// ============================================================================

#[tokio::test]
async fn one_result_per_call_in_input_order() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(tracked_action(probe.clone(), "a", 10))
        .with_action(tracked_action(probe.clone(), "b", 0))
        .with_action(tracked_action(probe.clone(), "c", 5));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![call("t1", "a"), call("t2", "b"), call("t3", "c")]);
    let report = engine.execute(plan).await.unwrap();

    let ids: Vec<&str> = report.results.iter().map(|r| r.tool_id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert!(report.all_succeeded());
}

#[tokio::test]
async fn call_never_starts_before_dependency_finishes() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(tracked_action(probe.clone(), "slow", 40))
        .with_action(tracked_action(probe.clone(), "after", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![
        call("dep", "slow"),
        call("use", "after").depends_on("dep"),
    ]);
    engine.execute(plan).await.unwrap();

    assert!(probe.ended_before_start("slow", "after"));
}

#[tokio::test]
async fn dependency_values_are_injected_into_params() {
    let probe = Arc::new(Probe::default());
    let seen = Arc::new(Mutex::new(Value::Null));
    let seen_in = seen.clone();
    let hub = Hub::new("h", "")
        .with_action(tracked_action(probe.clone(), "produce", 0))
        .with_action(Action::from_fn("consume", "records its params", move |params| {
            let seen = seen_in.clone();
            async move {
                *seen.lock() = params;
                Ok(json!("ok"))
            }
        }));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![
        call("src", "produce").with_params(json!({"x": 1})),
        call("sink", "consume")
            .with_params(json!({"own": true}))
            .depends_on("src"),
    ]);
    engine.execute(plan).await.unwrap();

    let params = seen.lock().clone();
    assert_eq!(params["own"], true);
    assert_eq!(params[DEPS_PARAM_KEY]["src"]["action"], "produce");
}

// ============================================================================
// Plan validation
// ============================================================================

#[tokio::test]
async fn cyclic_plan_is_rejected_with_zero_invocations() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(tracked_action(probe.clone(), "a", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![
        call("t1", "a").depends_on("t2"),
        call("t2", "a").depends_on("t1"),
    ]);
    let err = engine.execute(plan).await.unwrap_err();

    assert!(matches!(err, EngineError::InvalidPlan(_)));
    assert_eq!(probe.count("a", "start"), 0);
}

#[tokio::test]
async fn dangling_dependency_is_rejected() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(tracked_action(probe.clone(), "a", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![call("t1", "a").depends_on("ghost")]);
    let err = engine.execute(plan).await.unwrap_err();

    assert!(matches!(err, EngineError::InvalidPlan(_)));
    assert_eq!(probe.count("a", "start"), 0);
}

// ============================================================================
// Modes and concurrency
// ============================================================================

#[tokio::test]
async fn sequential_mode_starts_in_list_order() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(tracked_action(probe.clone(), "a", 10))
        .with_action(tracked_action(probe.clone(), "b", 10))
        .with_action(tracked_action(probe.clone(), "c", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::sequential(vec![call("t1", "a"), call("t2", "b"), call("t3", "c")]);
    engine.execute(plan).await.unwrap();

    assert_eq!(probe.starts(), vec!["a", "b", "c"]);
    assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_mode_respects_concurrency_bound() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(tracked_action(probe.clone(), "a", 30))
        .with_action(tracked_action(probe.clone(), "b", 30))
        .with_action(tracked_action(probe.clone(), "c", 30));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![call("t1", "a"), call("t2", "b"), call("t3", "c")])
        .max_concurrency(2);
    let report = engine.execute(plan).await.unwrap();

    assert!(report.all_succeeded());
    assert!(probe.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn configured_concurrency_bounds_plans_that_set_none() {
    let probe = Arc::new(Probe::default());
    let registry = Arc::new(Registry::new("test", "test registry"));
    registry.register(
        Hub::new("h", "")
            .with_action(tracked_action(probe.clone(), "a", 30))
            .with_action(tracked_action(probe.clone(), "b", 30)),
    );
    let engine = ExecutionEngine::with_defaults(
        registry,
        EngineDefaults {
            max_concurrency: 1,
            ..Default::default()
        },
    );

    // The plan leaves maxConcurrency unset, so the configured bound applies.
    let plan = ExecutionPlan::parallel(vec![call("t1", "a"), call("t2", "b")]);
    let report = engine.execute(plan).await.unwrap();

    assert!(report.all_succeeded());
    assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn plan_concurrency_overrides_the_configured_bound() {
    let probe = Arc::new(Probe::default());
    let registry = Arc::new(Registry::new("test", "test registry"));
    registry.register(
        Hub::new("h", "")
            .with_action(tracked_action(probe.clone(), "a", 30))
            .with_action(tracked_action(probe.clone(), "b", 30)),
    );
    let engine = ExecutionEngine::with_defaults(
        registry,
        EngineDefaults {
            max_concurrency: 1,
            ..Default::default()
        },
    );

    let plan = ExecutionPlan::parallel(vec![call("t1", "a"), call("t2", "b")])
        .max_concurrency(2);
    engine.execute(plan).await.unwrap();

    assert_eq!(probe.max_running.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn composite_group_runs_after_its_dependency() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(tracked_action(probe.clone(), "setup", 20))
        .with_action(tracked_action(probe.clone(), "member", 0))
        .with_action(tracked_action(probe.clone(), "teardown", 0));
    let (_registry, engine) = engine_with(hub);

    let group = ToolCall::group(
        "batch",
        vec![call("m1", "member"), call("m2", "member")],
    )
    .depends_on("init");
    let plan = ExecutionPlan::new(
        ExecutionMode::Composite,
        vec![
            call("init", "setup"),
            group,
            call("done", "teardown").depends_on("batch"),
        ],
    );
    let report = engine.execute(plan).await.unwrap();

    assert!(report.all_succeeded());
    assert_eq!(report.results.len(), 4);
    assert!(probe.ended_before_start("setup", "member"));
    assert!(probe.ended_before_start("member", "teardown"));
}

// ============================================================================
// Retry and fallback
// ============================================================================

#[tokio::test]
async fn always_failing_call_is_attempted_exactly_max_attempts_times() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(flaky_action(probe.clone(), "broken", usize::MAX));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::single(call("t1", "broken").with_retry(RetryPolicy::new(3)));
    let report = engine.execute(plan).await.unwrap();

    let result = report.result("t1").unwrap();
    assert_eq!(result.status, CallStatus::Failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(probe.count("broken", "start"), 3);
    assert!(result.error.as_deref().unwrap().contains("induced failure"));
}

#[tokio::test]
async fn retry_recovers_when_a_later_attempt_succeeds() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(flaky_action(probe.clone(), "flaky", 2));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::single(call("t1", "flaky").with_retry(RetryPolicy::new(3)));
    let report = engine.execute(plan).await.unwrap();

    let result = report.result("t1").unwrap();
    assert_eq!(result.status, CallStatus::Succeeded);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.value, Some(json!("recovered")));
}

#[tokio::test]
async fn configured_backoff_floor_delays_retries_without_their_own() {
    let probe = Arc::new(Probe::default());
    let registry = Arc::new(Registry::new("test", "test registry"));
    registry.register(Hub::new("h", "").with_action(flaky_action(probe.clone(), "flaky", 1)));
    let engine = ExecutionEngine::with_defaults(
        registry,
        EngineDefaults {
            retry_backoff_ms: 40,
            ..Default::default()
        },
    );

    // The policy sets no backoff, so the configured floor applies between
    // the two attempts.
    let started = std::time::Instant::now();
    let plan = ExecutionPlan::single(call("t1", "flaky").with_retry(RetryPolicy::new(2)));
    let report = engine.execute(plan).await.unwrap();

    let result = report.result("t1").unwrap();
    assert_eq!(result.status, CallStatus::Succeeded);
    assert_eq!(result.attempts, 2);
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn exhausted_retries_run_fallback_exactly_once() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(flaky_action(probe.clone(), "broken", usize::MAX))
        .with_action(tracked_action(probe.clone(), "backup", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::single(
        call("t1", "broken")
            .with_retry(RetryPolicy::new(2))
            .with_fallback(call("t1-fallback", "backup")),
    );
    let report = engine.execute(plan).await.unwrap();

    let result = report.result("t1").unwrap();
    assert_eq!(result.status, CallStatus::Succeeded);
    assert_eq!(result.attempts, 3); // two primary attempts + one fallback
    assert_eq!(probe.count("backup", "start"), 1);
    assert_eq!(result.value.as_ref().unwrap()["action"], "backup");
}

#[tokio::test]
async fn failing_fallback_leaves_call_failed() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(flaky_action(probe.clone(), "broken", usize::MAX))
        .with_action(flaky_action(probe.clone(), "also-broken", usize::MAX));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::single(
        call("t1", "broken").with_fallback(call("t1-fallback", "also-broken")),
    );
    let report = engine.execute(plan).await.unwrap();

    let result = report.result("t1").unwrap();
    assert_eq!(result.status, CallStatus::Failed);
    assert_eq!(probe.count("also-broken", "start"), 1);
}

// ============================================================================
// Failure propagation
// ============================================================================

#[tokio::test]
async fn fail_fast_skips_dependents_and_unstarted_independents() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(flaky_action(probe.clone(), "broken", usize::MAX))
        .with_action(tracked_action(probe.clone(), "fine", 0));
    let (_registry, engine) = engine_with(hub);

    // Concurrency 1 guarantees the independent call has not started when
    // the failure lands.
    let plan = ExecutionPlan::parallel(vec![
        call("a", "broken"),
        call("b", "fine").depends_on("a"),
        call("c", "fine"),
    ])
    .max_concurrency(1);
    let report = engine.execute(plan).await.unwrap();

    assert_eq!(report.result("a").unwrap().status, CallStatus::Failed);
    assert_eq!(report.result("b").unwrap().status, CallStatus::Skipped);
    assert_eq!(report.result("c").unwrap().status, CallStatus::Skipped);
    assert_eq!(probe.count("fine", "start"), 0);
}

#[tokio::test]
async fn fail_fast_lets_running_calls_finish() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(flaky_action(probe.clone(), "broken", usize::MAX))
        .with_action(tracked_action(probe.clone(), "slow", 50));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![call("a", "broken"), call("b", "slow")])
        .max_concurrency(2);
    let report = engine.execute(plan).await.unwrap();

    assert_eq!(report.result("a").unwrap().status, CallStatus::Failed);
    assert_eq!(report.result("b").unwrap().status, CallStatus::Succeeded);
}

#[tokio::test]
async fn continue_on_error_keeps_independent_branches_running() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(flaky_action(probe.clone(), "broken", usize::MAX))
        .with_action(tracked_action(probe.clone(), "fine", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![
        call("a", "broken"),
        call("b", "fine").depends_on("a"),
        call("c", "fine"),
    ])
    .max_concurrency(1)
    .continue_on_error(true);
    let report = engine.execute(plan).await.unwrap();

    assert_eq!(report.result("a").unwrap().status, CallStatus::Failed);
    assert_eq!(report.result("b").unwrap().status, CallStatus::Skipped);
    assert_eq!(report.result("c").unwrap().status, CallStatus::Succeeded);
}

#[tokio::test]
async fn unknown_action_fails_only_its_own_call() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(tracked_action(probe.clone(), "fine", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::parallel(vec![call("a", "missing"), call("b", "fine")])
        .continue_on_error(true);
    let report = engine.execute(plan).await.unwrap();

    let a = report.result("a").unwrap();
    assert_eq!(a.status, CallStatus::Failed);
    assert!(a.error.as_deref().unwrap().contains("Action not found"));
    assert_eq!(report.result("b").unwrap().status, CallStatus::Succeeded);
}

#[tokio::test]
async fn skipped_dependency_propagates_to_dependents() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(tracked_action(probe.clone(), "fine", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::new(
        ExecutionMode::Conditional,
        vec![
            call("a", "fine"),
            call("b", "fine").depends_on("a").with_condition("false"),
            call("c", "fine").depends_on("b"),
        ],
    )
    .continue_on_error(true);
    let report = engine.execute(plan).await.unwrap();

    assert_eq!(report.result("b").unwrap().status, CallStatus::Skipped);
    assert_eq!(report.result("c").unwrap().status, CallStatus::Skipped);
    assert_eq!(probe.count("fine", "start"), 1);
}

// ============================================================================
// Conditions
// ============================================================================

#[tokio::test]
async fn condition_over_dependency_value_gates_execution() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(Action::from_fn("emit", "returns a count", |_p| async {
            Ok(json!({"count": 5}))
        }))
        .with_action(tracked_action(probe.clone(), "high", 0))
        .with_action(tracked_action(probe.clone(), "low", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::new(
        ExecutionMode::Conditional,
        vec![
            call("n", "emit"),
            call("big", "high")
                .depends_on("n")
                .with_condition("n.value.count > 3"),
            call("small", "low")
                .depends_on("n")
                .with_condition("n.value.count <= 3"),
        ],
    );
    let report = engine.execute(plan).await.unwrap();

    assert_eq!(report.result("big").unwrap().status, CallStatus::Succeeded);
    assert_eq!(report.result("small").unwrap().status, CallStatus::Skipped);
    assert_eq!(probe.count("high", "start"), 1);
    assert_eq!(probe.count("low", "start"), 0);
}

#[tokio::test]
async fn condition_evaluation_error_fails_the_call() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(tracked_action(probe.clone(), "fine", 0));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::new(
        ExecutionMode::Conditional,
        vec![call("a", "fine").with_condition("nonsense.path == 1")],
    );
    let report = engine.execute(plan).await.unwrap();

    let a = report.result("a").unwrap();
    assert_eq!(a.status, CallStatus::Failed);
    assert_eq!(a.attempts, 0);
    assert_eq!(probe.count("fine", "start"), 0);
}

// ============================================================================
// Timeout and cancellation
// ============================================================================

#[tokio::test]
async fn per_call_timeout_is_a_retryable_failure() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "").with_action(tracked_action(probe.clone(), "slow", 200));
    let (_registry, engine) = engine_with(hub);

    let plan = ExecutionPlan::single(
        call("t1", "slow")
            .with_timeout_ms(30)
            .with_retry(RetryPolicy::new(2)),
    );
    let report = engine.execute(plan).await.unwrap();

    let result = report.result("t1").unwrap();
    assert_eq!(result.status, CallStatus::Failed);
    assert_eq!(result.attempts, 2);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn default_timeout_from_engine_defaults_applies() {
    let probe = Arc::new(Probe::default());
    let registry = Arc::new(Registry::new("test", "test registry"));
    registry.register(Hub::new("h", "").with_action(tracked_action(probe.clone(), "slow", 200)));
    let engine = ExecutionEngine::with_defaults(
        registry,
        EngineDefaults {
            default_timeout_ms: Some(30),
            ..Default::default()
        },
    );

    let report = engine
        .execute(ExecutionPlan::single(call("t1", "slow")))
        .await
        .unwrap();
    assert_eq!(report.result("t1").unwrap().status, CallStatus::Failed);
}

#[tokio::test]
async fn cancellation_stops_scheduling_and_raises() {
    let probe = Arc::new(Probe::default());
    let hub = Hub::new("h", "")
        .with_action(tracked_action(probe.clone(), "slow", 80))
        .with_action(tracked_action(probe.clone(), "next", 0));
    let registry = Arc::new(Registry::new("test", "test registry"));
    registry.register(hub);
    let engine = Arc::new(ExecutionEngine::new(registry));

    let cancel = CancelToken::new();
    let plan = ExecutionPlan::sequential(vec![call("a", "slow"), call("b", "next")]);

    let task = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.execute_cancellable(plan, cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    // The running call finished; the queued one never started.
    assert_eq!(probe.count("slow", "end"), 1);
    assert_eq!(probe.count("next", "start"), 0);
}
