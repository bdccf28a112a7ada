//! Execution plans: steps, their state machine, and the dependency DAG.
//!
//! - [`step`]  — `Step`, `StepId`, `StepStatus`, recovery markers
//! - [`graph`] — `ExecutionPlan` (validation, readiness, splicing, summary)
//! - [`error`] — `PlanningError` / `PlanResult`

pub mod error;
pub mod graph;
pub mod step;

pub use error::{PlanResult, PlanningError};
pub use graph::{ExecutionPlan, PlanGap, PlanOutcome, PlanSummary, StepSummary};
pub use step::{Params, RecoveryInfo, RecoveryStrategy, Step, StepId, StepStatus};
