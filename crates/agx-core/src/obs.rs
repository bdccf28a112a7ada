//! Structured observability hooks for plan and sandbox lifecycle events.
//!
//! This module provides:
//! - Plan-scoped tracing spans via `PlanSpan` RAII guard
//! - Emission functions for key lifecycle events: plan built, step transition,
//!   replan, sandbox finished, plan finished
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::info;

use crate::plan::{PlanOutcome, StepId, StepStatus};
use crate::sandbox::ExecutionResult;

/// RAII guard that enters a plan-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = PlanSpan::enter(&plan.id().to_string());
/// // all tracing calls now carry plan_id
/// ```
pub struct PlanSpan {
    _span: tracing::span::EnteredSpan,
}

impl PlanSpan {
    /// Create and enter a span tagged with the plan id.
    pub fn enter(plan_id: &str) -> Self {
        let span = tracing::info_span!("agx.plan", plan_id = %plan_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: plan built from a task description.
pub fn emit_plan_built(plan_id: &str, intent: &str, steps: usize, gaps: usize, digest: &str) {
    info!(
        event = "plan.built",
        plan_id = %plan_id,
        intent = %intent,
        steps = steps,
        gaps = gaps,
        digest = %digest,
    );
}

/// Emit event: one step changed status.
pub fn emit_step_transition(plan_id: &str, step: &StepId, tool: &str, status: StepStatus) {
    info!(
        event = "step.transition",
        plan_id = %plan_id,
        step = %step,
        tool = %tool,
        status = %status,
    );
}

/// Emit event: a recovery step was spliced in for a failed step.
pub fn emit_replanned(plan_id: &str, failed: &StepId, recovery: &StepId, strategy: &str) {
    info!(
        event = "plan.replanned",
        plan_id = %plan_id,
        failed = %failed,
        recovery = %recovery,
        strategy = %strategy,
    );
}

/// Emit event: one sandbox execution finished.
pub fn emit_sandbox_finished(result: &ExecutionResult) {
    info!(
        event = "sandbox.finished",
        success = result.success,
        termination = %result.termination_reason,
        duration_ms = (result.duration_seconds * 1000.0) as u64,
        truncated = result.truncated,
        exit_code = ?result.exit_code,
    );
}

/// Emit event: plan walk finished.
pub fn emit_plan_finished(plan_id: &str, duration_ms: u64, outcome: &PlanOutcome) {
    let (failed, blocked) = match outcome {
        PlanOutcome::Completed => (0, 0),
        PlanOutcome::Incomplete { failed, blocked } => (failed.len(), blocked.len()),
        PlanOutcome::Cancelled { interrupted, pending } => (interrupted.len(), pending.len()),
    };
    info!(
        event = "plan.finished",
        plan_id = %plan_id,
        duration_ms = duration_ms,
        completed = outcome.is_completed(),
        failed = failed,
        blocked = blocked,
    );
}

/// Emit event: walk aborted on a fatal error (warning level).
pub fn emit_walk_error(plan_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "plan.walk_error", plan_id = %plan_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_span_create() {
        let _span = PlanSpan::enter("test-plan-id");
        emit_step_transition("test-plan-id", &StepId::nth(1), "search", StepStatus::Running);
    }
}
