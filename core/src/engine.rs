//! Execution engine: schedules a plan's calls against the registry.
//!
//! One engine invocation owns one plan. The scheduler task is the only
//! owner of the node-state table and ready queue; worker tasks dispatch
//! individual calls through the registry and report outcomes back over an
//! mpsc channel. Retry, backoff, fallback, and timeout policy all run
//! inside the worker, so a node occupies exactly one concurrency slot for
//! its whole lifetime.
//!
//! Guarantees:
//! - a call never starts before all its dependencies succeeded;
//! - at most `max_concurrency` calls run at once (1 for single/sequential);
//! - results come back one per input call, in input order;
//! - per-call failures never abort the plan, they are reported in the
//!   result set (validation errors and cancellation are the only ways
//!   `execute` itself fails).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::condition::{self, ConditionContext};
use crate::errors::{CallError, EngineError, EngineResult};
use crate::graph::CallGraph;
use crate::plan::{
    CallStatus, ExecutionMode, ExecutionPlan, ExecutionResult, PlanReport, ToolCall,
};
use crate::registry::Registry;

/// Reserved params key under which dependency outputs are injected.
pub const DEPS_PARAM_KEY: &str = "__deps";

/// Cancellation handle for an in-flight plan.
///
/// Cancelling stops the scheduling of new calls immediately; calls already
/// dispatched run to completion (action handlers are non-preemptible) and
/// every not-yet-started call is marked skipped.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine-level defaults, typically sourced from configuration.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    /// Applied to calls that declare no timeout of their own.
    pub default_timeout_ms: Option<u64>,
    /// Concurrency bound for plans whose options leave it unset.
    pub max_concurrency: usize,
    /// Backoff floor, in milliseconds, for retry policies that set none.
    pub retry_backoff_ms: u64,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            max_concurrency: 4,
            retry_backoff_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Failed | NodeState::Skipped)
    }
}

/// Outcome reported by one worker task.
struct CallOutcome {
    status: CallStatus,
    value: Option<Value>,
    error: Option<String>,
    attempts: u32,
    duration_ms: u64,
}

/// Schedules execution plans against a registry.
pub struct ExecutionEngine {
    registry: Arc<Registry>,
    defaults: EngineDefaults,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            defaults: EngineDefaults::default(),
        }
    }

    pub fn with_defaults(registry: Arc<Registry>, defaults: EngineDefaults) -> Self {
        Self { registry, defaults }
    }

    /// Execute a plan to completion.
    pub async fn execute(&self, plan: ExecutionPlan) -> EngineResult<PlanReport> {
        self.execute_cancellable(plan, CancelToken::new()).await
    }

    /// Execute a plan, observing `cancel` between completions.
    pub async fn execute_cancellable(
        &self,
        plan: ExecutionPlan,
        cancel: CancelToken,
    ) -> EngineResult<PlanReport> {
        let graph = CallGraph::build(&plan)?;
        let n = graph.node_count();

        let run_id = Uuid::new_v4();
        let started_at = chrono::Utc::now();
        let started = Instant::now();

        let limit = match plan.mode {
            ExecutionMode::Single | ExecutionMode::Sequential => 1,
            _ => plan
                .options
                .max_concurrency
                .unwrap_or(self.defaults.max_concurrency)
                .max(1),
        };
        let continue_on_error = plan.options.continue_on_error;

        info!(
            %run_id,
            mode = %plan.mode,
            calls = n,
            max_concurrency = limit,
            continue_on_error,
            "executing plan"
        );

        let mut states = vec![NodeState::Pending; n];
        let mut results: Vec<Option<ExecutionResult>> = (0..n).map(|_| None).collect();
        let mut values: Vec<Option<Value>> = (0..n).map(|_| None).collect();

        let mut ready: VecDeque<usize> = graph.roots().into();
        let mut in_flight = 0usize;
        let mut terminal = 0usize;
        let mut halted = false;
        let mut cancelled = cancel.is_cancelled();

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, CallOutcome)>();
        let mut cancel_rx = cancel.subscribe();

        while terminal < n {
            // Start ready nodes while capacity allows.
            while !halted && !cancelled && in_flight < limit {
                let Some(idx) = ready.pop_front() else { break };
                if states[idx] != NodeState::Pending {
                    continue;
                }

                let node = graph.node(idx);
                match self.check_condition(&graph, idx, &states, &values) {
                    ConditionCheck::Run => {
                        states[idx] = NodeState::Running;
                        in_flight += 1;
                        debug!(%run_id, tool_id = %node.call.tool_id, "starting call");
                        self.spawn_worker(idx, &graph, &values, tx.clone());
                    }
                    ConditionCheck::Skip => {
                        debug!(%run_id, tool_id = %node.call.tool_id, "condition false, skipping");
                        terminal += self.skip_node(&graph, idx, &mut states, &mut results);
                    }
                    ConditionCheck::Error(err) => {
                        warn!(%run_id, tool_id = %node.call.tool_id, error = %err, "condition error");
                        states[idx] = NodeState::Failed;
                        results[idx] = Some(ExecutionResult {
                            tool_id: node.call.tool_id.clone(),
                            status: CallStatus::Failed,
                            value: None,
                            error: Some(err.to_string()),
                            attempts: 0,
                            duration_ms: 0,
                        });
                        terminal += 1;
                        terminal += self.skip_dependents(&graph, idx, &mut states, &mut results);
                        if !continue_on_error {
                            halted = true;
                        }
                    }
                }
            }

            if terminal >= n {
                break;
            }

            if in_flight == 0 {
                // Nothing running and nothing startable: every remaining
                // node is unreachable (halted plan or failed dependencies).
                terminal += self.skip_remaining(&graph, &mut states, &mut results);
                continue;
            }

            let completion = tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_ok() && *cancel_rx.borrow() {
                        info!(%run_id, "plan cancelled, letting running calls finish");
                        cancelled = true;
                        ready.clear();
                    }
                    continue;
                }
                msg = rx.recv() => msg,
            };

            let Some((idx, outcome)) = completion else {
                return Err(EngineError::Internal("completion channel closed".into()));
            };
            in_flight -= 1;
            terminal += 1;

            let tool_id = graph.node(idx).call.tool_id.clone();
            match outcome.status {
                CallStatus::Succeeded => {
                    debug!(%run_id, %tool_id, attempts = outcome.attempts, "call succeeded");
                    states[idx] = NodeState::Succeeded;
                    values[idx] = outcome.value.clone();
                    if !cancelled && !halted {
                        for &dep in graph.dependents(idx) {
                            if states[dep] == NodeState::Pending
                                && graph
                                    .dependencies(dep)
                                    .iter()
                                    .all(|&d| states[d] == NodeState::Succeeded)
                            {
                                ready.push_back(dep);
                            }
                        }
                    }
                }
                CallStatus::Failed => {
                    warn!(
                        %run_id, %tool_id,
                        attempts = outcome.attempts,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "call failed"
                    );
                    states[idx] = NodeState::Failed;
                    terminal += self.skip_dependents(&graph, idx, &mut states, &mut results);
                    if !continue_on_error {
                        halted = true;
                        ready.clear();
                    }
                }
                CallStatus::Skipped => unreachable!("workers never report skipped"),
            }

            results[idx] = Some(ExecutionResult {
                tool_id,
                status: outcome.status,
                value: outcome.value,
                error: outcome.error,
                attempts: outcome.attempts,
                duration_ms: outcome.duration_ms,
            });
        }

        if cancelled {
            return Err(EngineError::Cancelled);
        }

        let results: Vec<ExecutionResult> = results
            .into_iter()
            .enumerate()
            .map(|(idx, r)| {
                r.unwrap_or_else(|| ExecutionResult::skipped(graph.node(idx).call.tool_id.clone()))
            })
            .collect();

        let report = PlanReport {
            run_id,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            results,
        };
        info!(
            %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            duration_ms = report.duration_ms,
            "plan finished"
        );
        Ok(report)
    }

    fn check_condition(
        &self,
        graph: &CallGraph,
        idx: usize,
        states: &[NodeState],
        values: &[Option<Value>],
    ) -> ConditionCheck {
        let Some(expr) = graph.node(idx).call.condition.as_deref() else {
            return ConditionCheck::Run;
        };

        let mut ctx = ConditionContext::new();
        for &dep in graph.dependencies(idx) {
            let status = match states[dep] {
                NodeState::Succeeded => "succeeded",
                NodeState::Failed => "failed",
                NodeState::Skipped => "skipped",
                _ => continue,
            };
            ctx.set(
                &graph.node(dep).call.tool_id,
                json!({
                    "status": status,
                    "value": values[dep].clone().unwrap_or(Value::Null),
                }),
            );
        }

        match condition::evaluate(expr, &ctx) {
            Ok(true) => ConditionCheck::Run,
            Ok(false) => ConditionCheck::Skip,
            Err(err) => ConditionCheck::Error(CallError::Condition(err)),
        }
    }

    fn spawn_worker(
        &self,
        idx: usize,
        graph: &CallGraph,
        values: &[Option<Value>],
        tx: mpsc::UnboundedSender<(usize, CallOutcome)>,
    ) {
        let call = graph.node(idx).call.clone();
        let params = inject_deps(graph, idx, values, call.params.clone());
        let registry = self.registry.clone();
        let defaults = self.defaults.clone();

        tokio::spawn(async move {
            let outcome = run_call(&registry, &call, params, &defaults).await;
            let _ = tx.send((idx, outcome));
        });
    }

    /// Mark a node skipped (condition false) and cascade to dependents.
    /// Returns how many nodes newly became terminal.
    fn skip_node(
        &self,
        graph: &CallGraph,
        idx: usize,
        states: &mut [NodeState],
        results: &mut [Option<ExecutionResult>],
    ) -> usize {
        let mut count = 0;
        if !states[idx].is_terminal() {
            states[idx] = NodeState::Skipped;
            results[idx] = Some(ExecutionResult::skipped(&graph.node(idx).call.tool_id));
            count += 1;
        }
        count + self.skip_dependents(graph, idx, states, results)
    }

    /// Skip every transitive dependent of a failed or skipped node.
    fn skip_dependents(
        &self,
        graph: &CallGraph,
        idx: usize,
        states: &mut [NodeState],
        results: &mut [Option<ExecutionResult>],
    ) -> usize {
        let mut count = 0;
        for dep in graph.transitive_dependents(idx) {
            if !states[dep].is_terminal() {
                states[dep] = NodeState::Skipped;
                results[dep] = Some(ExecutionResult::skipped(&graph.node(dep).call.tool_id));
                count += 1;
            }
        }
        count
    }

    /// Skip everything that is not yet terminal (halted or cancelled plan).
    fn skip_remaining(
        &self,
        graph: &CallGraph,
        states: &mut [NodeState],
        results: &mut [Option<ExecutionResult>],
    ) -> usize {
        let mut count = 0;
        for idx in 0..graph.node_count() {
            if !states[idx].is_terminal() {
                states[idx] = NodeState::Skipped;
                results[idx] = Some(ExecutionResult::skipped(&graph.node(idx).call.tool_id));
                count += 1;
            }
        }
        count
    }
}

enum ConditionCheck {
    Run,
    Skip,
    Error(CallError),
}

/// Merge the values of succeeded dependencies into the call's params under
/// [`DEPS_PARAM_KEY`], keyed by dependency toolId. Params that are neither
/// an object nor null are passed through untouched.
fn inject_deps(graph: &CallGraph, idx: usize, values: &[Option<Value>], params: Value) -> Value {
    let deps = graph.dependencies(idx);
    if deps.is_empty() {
        return params;
    }

    let mut dep_map = serde_json::Map::new();
    for &dep in deps {
        if let Some(value) = &values[dep] {
            dep_map.insert(graph.node(dep).call.tool_id.clone(), value.clone());
        }
    }
    if dep_map.is_empty() {
        return params;
    }

    match params {
        Value::Object(mut map) => {
            map.insert(DEPS_PARAM_KEY.to_string(), Value::Object(dep_map));
            Value::Object(map)
        }
        Value::Null => json!({ DEPS_PARAM_KEY: Value::Object(dep_map) }),
        other => other,
    }
}

/// Run one call: primary attempts under the retry policy, then at most one
/// fallback run. The attempt counter covers both.
async fn run_call(
    registry: &Registry,
    call: &ToolCall,
    params: Value,
    defaults: &EngineDefaults,
) -> CallOutcome {
    let started = Instant::now();
    // Policies that leave backoff unset inherit the configured floor.
    let retry = call.retry.clone().map(|mut r| {
        if r.backoff_ms == 0 {
            r.backoff_ms = defaults.retry_backoff_ms;
        }
        r
    });
    let max_attempts = retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
    let mut attempts = 0;
    let mut last_error: Option<CallError> = None;

    while attempts < max_attempts {
        attempts += 1;
        match dispatch_once(
            registry,
            &call.action,
            params.clone(),
            call.timeout_ms,
            defaults.default_timeout_ms,
        )
        .await
        {
            Ok(value) => {
                return CallOutcome {
                    status: CallStatus::Succeeded,
                    value: Some(value),
                    error: None,
                    attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(err) => {
                debug!(
                    action = %call.action,
                    attempt = attempts,
                    max_attempts,
                    error = %err,
                    "attempt failed"
                );
                last_error = Some(err);
                if attempts < max_attempts {
                    if let Some(retry) = &retry {
                        let delay = retry.delay_after(attempts);
                        if delay > Duration::ZERO {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    // Retries exhausted; the fallback (if any) runs exactly once.
    if let Some(fallback) = &call.fallback {
        attempts += 1;
        debug!(action = %call.action, fallback = %fallback.action, "running fallback");
        match dispatch_once(
            registry,
            &fallback.action,
            fallback.params.clone(),
            fallback.timeout_ms,
            defaults.default_timeout_ms,
        )
        .await
        {
            Ok(value) => {
                return CallOutcome {
                    status: CallStatus::Succeeded,
                    value: Some(value),
                    error: None,
                    attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(err) => last_error = Some(err),
        }
    }

    CallOutcome {
        status: CallStatus::Failed,
        value: None,
        error: last_error.map(|e| e.to_string()),
        attempts,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn dispatch_once(
    registry: &Registry,
    action: &str,
    params: Value,
    timeout_ms: Option<u64>,
    default_timeout_ms: Option<u64>,
) -> Result<Value, CallError> {
    match timeout_ms.or(default_timeout_ms) {
        Some(ms) => match tokio::time::timeout(
            Duration::from_millis(ms),
            registry.dispatch(action, params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout {
                action: action.to_string(),
                timeout_ms: ms,
            }),
        },
        None => registry.dispatch(action, params).await,
    }
}
