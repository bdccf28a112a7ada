//! agx core library
//!
//! Plans multi-step tasks as a dependency graph of tool invocations, walks
//! the graph, runs code steps in a resource-limited sandbox, and splices in
//! one recovery step when a step fails.

pub mod config;
pub mod metrics;
pub mod obs;
pub mod plan;
pub mod planner;
pub mod sandbox;
pub mod telemetry;
pub mod tooling;
pub mod walk;

pub use config::{AgxConfig, ConfigError};

pub use plan::{
    ExecutionPlan, Params, PlanGap, PlanOutcome, PlanResult, PlanSummary, PlanningError,
    RecoveryInfo, RecoveryStrategy, Step, StepId, StepStatus, StepSummary,
};

pub use planner::{
    classify_message, replan_on_failure, FailureClass, FailureReason, TaskIntent, TaskPlanner,
    DIAGNOSTIC_TOOL, FILE_READ_TOOL, FILE_WRITE_TOOL, RUN_CODE_TOOL, SEARCH_TOOL, SHELL_TOOL,
};

pub use sandbox::{
    default_limiter, ExecutionResult, PortableLimiter, ResourceLimiter, SandboxConfig,
    SandboxError, SandboxResult, SandboxSession, TerminationReason,
};

pub use tooling::{ParamType, ParameterSchema, ParameterSpec, Tool, ToolError, ToolRegistry, ToolResult};

pub use walk::{PlanWalker, Replan, SharedPlan, WalkConfig, WalkError, WalkReport, WalkResult};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
