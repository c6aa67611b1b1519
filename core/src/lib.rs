// Maestro: tool execution orchestrator
// Core library providing the action registry, dependency-aware execution
// engine, and the textual call surfaces that feed it.

pub mod condition;
pub mod config;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod plan;
pub mod registry;
pub mod surface;

// Re-export commonly used types
pub use errors::{
    CallError, CallResult, ConditionError, ConditionResult, ConfigError, ConfigResult,
    EngineError, EngineResult, PlanError, PlanResult,
};

pub use registry::{Action, ActionHandler, ActionInfo, Hub, Registry};

pub use plan::{
    CallStatus, ExecutionMode, ExecutionOptions, ExecutionPlan, ExecutionResult, PlanReport,
    RetryPolicy, ToolCall,
};

pub use engine::{CancelToken, EngineDefaults, ExecutionEngine, DEPS_PARAM_KEY};

pub use graph::{CallGraph, CallNode};

pub use condition::ConditionContext;

pub use config::{ConfigLoader, EngineConfig, LoggingConfig, OrchestratorConfig, RetryDefaults};

pub use surface::{parse_plan, parse_structured, parse_tagged};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
