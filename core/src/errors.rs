/// Error types for the Maestro tool-execution orchestrator.
use thiserror::Error;

/// Errors raised while building or validating an execution plan.
///
/// All of these reject the plan before any action is invoked, so a
/// malformed plan never has side effects.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Execution plan contains no calls")]
    EmptyPlan,

    #[error("Duplicate toolId in plan: {0}")]
    DuplicateToolId(String),

    #[error("Call '{tool_id}' depends on unknown toolId '{depends_on}'")]
    UnknownDependency { tool_id: String, depends_on: String },

    #[error("Call '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Single mode requires exactly one call, got {0}")]
    SingleModeArity(usize),

    #[error("Composite group '{0}' must contain at least one nested call")]
    EmptyGroup(String),

    #[error("Malformed plan document: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for plan construction and validation.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors attributed to a single tool call.
///
/// These never escape the execution engine; they end up in that call's
/// `ExecutionResult` after the retry/fallback policy has run its course.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action '{action}' failed: {source}")]
    ActionFailed {
        action: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Action '{action}' timed out after {timeout_ms}ms")]
    Timeout { action: String, timeout_ms: u64 },

    #[error("Condition evaluation failed: {0}")]
    Condition(#[from] ConditionError),
}

/// Result type for a single dispatched call.
pub type CallResult<T> = Result<T, CallError>;

/// Errors the engine itself can raise from `execute`.
///
/// Per-call failures are reported through the result set instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid execution plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("Plan cancelled")]
    Cancelled,

    #[error("Engine internal error: {0}")]
    Internal(String),
}

/// Result type for whole-plan execution.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from the condition expression evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Parse error at position {position}: {message}")]
    ParseError { position: usize, message: String },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Empty expression")]
    EmptyExpression,
}

/// Result type for condition evaluation.
pub type ConditionResult<T> = Result<T, ConditionError>;

/// Errors from configuration discovery and loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
