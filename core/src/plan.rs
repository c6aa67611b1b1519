//! Execution plan data model: tool calls, modes, options, and results.
//!
//! A plan is constructed per request, consumed by one engine invocation,
//! and discarded; no cross-request state lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How the engine interprets a plan's call list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Exactly one call.
    Single,
    /// List order becomes a dependency chain; concurrency forced to 1.
    Sequential,
    /// Only declared dependencies constrain ordering.
    Parallel,
    /// Like parallel, but calls may carry `condition` predicates.
    Conditional,
    /// Calls may be groups of nested calls, expanded into the parent graph.
    Composite,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Single => "single",
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Conditional => "conditional",
            ExecutionMode::Composite => "composite",
        };
        f.write_str(s)
    }
}

/// Retry configuration for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
    /// Backoff growth factor per subsequent attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
        }
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Delay to apply after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        if self.backoff_ms == 0 {
            return std::time::Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 - 1);
        std::time::Duration::from_millis((self.backoff_ms as f64 * factor) as u64)
    }
}

/// One requested invocation within an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within one plan; the key results are reported under.
    pub tool_id: String,
    /// Action name resolved through the registry. Empty for group nodes.
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Predicate over completed dependency results; false skips the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Run once if the primary (and its retries) fail; never retried itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Nested calls; non-empty marks this call as a composite group that is
    /// expanded into the parent graph and never dispatched itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<ToolCall>,
}

impl ToolCall {
    pub fn new(tool_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            action: action.into(),
            params: Value::Null,
            depends_on: Vec::new(),
            condition: None,
            retry: None,
            fallback: None,
            timeout_ms: None,
            calls: Vec::new(),
        }
    }

    /// A composite group of nested calls.
    pub fn group(tool_id: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut call = Self::new(tool_id, "");
        call.calls = calls;
        call
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on(mut self, tool_id: impl Into<String>) -> Self {
        self.depends_on.push(tool_id.into());
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_fallback(mut self, fallback: ToolCall) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn is_group(&self) -> bool {
        !self.calls.is_empty()
    }
}

/// Plan-wide execution options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Keep independent branches running after a terminal failure.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Upper bound on concurrently running calls (at least 1). Unset means
    /// the engine's configured default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// A set of tool calls plus an execution mode and options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    pub calls: Vec<ToolCall>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl ExecutionPlan {
    pub fn new(mode: ExecutionMode, calls: Vec<ToolCall>) -> Self {
        Self {
            mode,
            calls,
            options: ExecutionOptions::default(),
        }
    }

    pub fn single(call: ToolCall) -> Self {
        Self::new(ExecutionMode::Single, vec![call])
    }

    pub fn sequential(calls: Vec<ToolCall>) -> Self {
        Self::new(ExecutionMode::Sequential, calls)
    }

    pub fn parallel(calls: Vec<ToolCall>) -> Self {
        Self::new(ExecutionMode::Parallel, calls)
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn continue_on_error(mut self, yes: bool) -> Self {
        self.options.continue_on_error = yes;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.options.max_concurrency = Some(n.max(1));
        self
    }
}

/// Terminal status of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Final outcome of one tool call within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tool_id: String,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Dispatch attempts made, counting retries and a fallback run.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn skipped(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            status: CallStatus::Skipped,
            value: None,
            error: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == CallStatus::Succeeded
    }
}

/// Run-level summary: one `ExecutionResult` per input call, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: Vec<ExecutionResult>,
}

impl PlanReport {
    pub fn result(&self, tool_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.tool_id == tool_id)
    }

    pub fn succeeded(&self) -> usize {
        self.count(CallStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(CallStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(CallStatus::Skipped)
    }

    fn count(&self, status: CallStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// True when every call succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(ExecutionResult::succeeded)
    }
}
