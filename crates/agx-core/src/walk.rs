//! Plan walker: runs an execution plan in dependency order.
//!
//! Ready steps are dispatched concurrently up to `max_concurrent`. `run_code`
//! steps go through a fresh sandbox session each; everything else goes
//! through the [`ToolRegistry`]. Workers never touch the plan: they report an
//! outcome and the walk loop applies every transition under the plan lock.
//! A failed step is handed to the planner once; the recovery step it gets
//! back is scheduled like any other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::metrics::METRICS;
use crate::obs;
use crate::plan::{
    ExecutionPlan, Params, PlanOutcome, PlanSummary, PlanningError, Step, StepId, StepStatus,
};
use crate::planner::{
    replan_on_failure, FailureClass, FailureReason, DIAGNOSTIC_TOOL, RUN_CODE_TOOL,
};
use crate::sandbox::{SandboxConfig, SandboxError, SandboxSession};
use crate::tooling::ToolRegistry;

/// Walk tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    /// Upper bound on steps running at once.
    pub max_concurrent: usize,
    /// Hand failed steps to the planner for one recovery attempt.
    pub replan: bool,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            replan: true,
        }
    }
}

/// Fatal walk errors. Step failures are not errors.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error("planning fault: {0}")]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("invalid walk configuration: {0}")]
    InvalidConfig(String),
}

pub type WalkResult<T> = std::result::Result<T, WalkError>;

/// Plan behind a lock; each status change is one locked update.
#[derive(Debug, Clone)]
pub struct SharedPlan {
    inner: Arc<Mutex<ExecutionPlan>>,
}

impl SharedPlan {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self {
            inner: Arc::new(Mutex::new(plan)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ExecutionPlan> {
        self.inner.lock().await
    }

    /// Copy of the current plan state.
    pub async fn snapshot(&self) -> ExecutionPlan {
        self.inner.lock().await.clone()
    }
}

/// A recovery step spliced in during the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replan {
    pub failed: StepId,
    pub recovery: StepId,
    pub reason: FailureReason,
}

/// What the caller gets back from a walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkReport {
    pub plan_id: String,
    pub outcome: PlanOutcome,
    pub summary: PlanSummary,
    pub replans: Vec<Replan>,
    pub duration_ms: u64,
}

/// Result a worker reports for one step.
#[derive(Debug)]
enum StepOutcome {
    Completed(Value),
    Failed(FailureReason),
    Interrupted,
    Fault(WalkError),
}

/// Drives a plan to completion.
#[derive(Debug, Clone)]
pub struct PlanWalker {
    registry: Arc<ToolRegistry>,
    sandbox: SandboxConfig,
    config: WalkConfig,
}

impl PlanWalker {
    pub fn new(registry: Arc<ToolRegistry>, sandbox: SandboxConfig, config: WalkConfig) -> Self {
        Self {
            registry,
            sandbox,
            config,
        }
    }

    /// Walk `plan` and return the final plan with the report.
    pub async fn run(
        &self,
        plan: ExecutionPlan,
        cancel: CancellationToken,
    ) -> WalkResult<(ExecutionPlan, WalkReport)> {
        let shared = SharedPlan::new(plan);
        let report = self.walk(&shared, cancel).await?;
        Ok((shared.snapshot().await, report))
    }

    /// Walk a shared plan until it settles, a fatal error occurs, or
    /// `cancel` fires. In-flight steps are always awaited before returning.
    pub async fn walk(&self, plan: &SharedPlan, cancel: CancellationToken) -> WalkResult<WalkReport> {
        if self.config.max_concurrent == 0 {
            return Err(WalkError::InvalidConfig(
                "max_concurrent must be > 0".into(),
            ));
        }
        let plan_id = plan.lock().await.id().to_string();
        let span = info_span!("agx.plan", plan_id = %plan_id);
        self.walk_inner(plan, &plan_id, cancel).instrument(span).await
    }

    async fn walk_inner(
        &self,
        plan: &SharedPlan,
        plan_id: &str,
        cancel: CancellationToken,
    ) -> WalkResult<WalkReport> {
        let started = Instant::now();
        plan.lock().await.validate()?;

        let mut tasks: JoinSet<StepOutcome> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, StepId> = HashMap::new();
        let mut replans = Vec::new();
        let workers = cancel.child_token();

        let cancelled = loop {
            if cancel.is_cancelled() {
                break true;
            }

            let capacity = self.config.max_concurrent.saturating_sub(tasks.len());
            if capacity > 0 {
                let mut guard = plan.lock().await;
                for id in guard.ready_steps().into_iter().take(capacity) {
                    guard.mark_running(&id)?;
                    let step = resolve_inputs(&guard, &id)?;
                    obs::emit_step_transition(plan_id, &id, step.tool(), StepStatus::Running);
                    let handle = tasks.spawn(run_step(
                        step,
                        self.registry.clone(),
                        self.sandbox.clone(),
                        workers.child_token(),
                    ));
                    in_flight.insert(handle.id(), id);
                }
            }

            if tasks.is_empty() {
                break false;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                joined = tasks.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                continue;
            };

            let (task_id, outcome) = match joined {
                Ok((task_id, outcome)) => (task_id, outcome),
                Err(e) => (
                    e.id(),
                    StepOutcome::Failed(FailureReason::classified(
                        FailureClass::Unclassified,
                        format!("step worker panicked: {e}"),
                    )),
                ),
            };
            let Some(id) = in_flight.remove(&task_id) else {
                continue;
            };

            let applied = self.apply(plan, plan_id, &id, outcome, true).await;
            match applied {
                Ok(Some(replan)) => replans.push(replan),
                Ok(None) => {}
                Err(e) => {
                    obs::emit_walk_error(plan_id, &e);
                    workers.cancel();
                    drain(&mut tasks).await;
                    return Err(e);
                }
            }
        };

        if cancelled {
            debug!("walk cancelled, waiting for in-flight steps");
            workers.cancel();
            // Steps that finished before noticing the cancel keep their
            // outcome. Nothing is replanned once the walk is cancelled.
            while let Some(joined) = tasks.join_next_with_id().await {
                let (task_id, outcome) = match joined {
                    Ok(joined) => joined,
                    Err(e) => {
                        warn!(error = %e, "step worker failed during shutdown");
                        continue;
                    }
                };
                let Some(id) = in_flight.remove(&task_id) else {
                    continue;
                };
                if let Err(e) = self.apply(plan, plan_id, &id, outcome, false).await {
                    warn!(step = %id, error = %e, "step fault after cancellation");
                }
            }
        }

        let guard = plan.lock().await;
        let outcome = if cancelled {
            PlanOutcome::Cancelled {
                interrupted: guard.running_steps(),
                pending: guard.pending_steps(),
            }
        } else {
            guard.outcome()
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_plan_finished(plan_id, duration_ms, &outcome);

        Ok(WalkReport {
            plan_id: plan_id.to_string(),
            outcome,
            summary: guard.summary(),
            replans,
            duration_ms,
        })
    }

    /// Apply one worker outcome to the plan. Failures are only handed to
    /// the planner when `replan` is set.
    async fn apply(
        &self,
        plan: &SharedPlan,
        plan_id: &str,
        id: &StepId,
        outcome: StepOutcome,
        replan: bool,
    ) -> WalkResult<Option<Replan>> {
        let mut guard = plan.lock().await;
        let tool = guard
            .step(id)
            .map(|s| s.tool().to_string())
            .unwrap_or_default();

        match outcome {
            StepOutcome::Completed(value) => {
                guard.mark_completed(id, value)?;
                METRICS.inc_steps_completed();
                obs::emit_step_transition(plan_id, id, &tool, StepStatus::Completed);
                Ok(None)
            }
            StepOutcome::Failed(reason) => {
                guard.mark_failed(id, reason.message.clone())?;
                METRICS.inc_steps_failed();
                obs::emit_step_transition(plan_id, id, &tool, StepStatus::Failed);
                if !(replan && self.config.replan) {
                    return Ok(None);
                }
                match replan_on_failure(&mut guard, id, &reason) {
                    Ok(recovery) => Ok(Some(Replan {
                        failed: id.clone(),
                        recovery,
                        reason,
                    })),
                    Err(
                        e @ (PlanningError::AlreadyReplanned { .. }
                        | PlanningError::RecoveryExhausted { .. }),
                    ) => {
                        warn!(step = %id, error = %e, "step failed terminally");
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            // Left Running; reported as interrupted.
            StepOutcome::Interrupted => Ok(None),
            StepOutcome::Fault(e) => {
                guard.mark_failed(id, e.to_string())?;
                METRICS.inc_steps_failed();
                obs::emit_step_transition(plan_id, id, &tool, StepStatus::Failed);
                Err(e)
            }
        }
    }
}

async fn drain(tasks: &mut JoinSet<StepOutcome>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "step worker failed during shutdown");
        }
    }
}

/// Clone the step for dispatch, filling `input` from its `from_step`.
///
/// When the referenced step was superseded, the recovery step's result is
/// used.
fn resolve_inputs(plan: &ExecutionPlan, id: &StepId) -> WalkResult<Step> {
    let mut step = plan
        .step(id)
        .cloned()
        .ok_or_else(|| PlanningError::UnknownStep { step: id.clone() })?;
    let source = step
        .params()
        .get("from_step")
        .and_then(Value::as_str)
        .map(StepId::from);
    if let Some(source) = source {
        let result = plan.step(&source).and_then(|s| match s.status() {
            StepStatus::Completed => s.result().cloned(),
            _ => s
                .superseded_by()
                .and_then(|r| plan.step(r))
                .and_then(|r| r.result().cloned()),
        });
        if let Some(result) = result {
            step = step.with_param("input", result);
        }
    }
    Ok(step)
}

async fn run_step(
    step: Step,
    registry: Arc<ToolRegistry>,
    sandbox: SandboxConfig,
    cancel: CancellationToken,
) -> StepOutcome {
    match step.tool() {
        RUN_CODE_TOOL => run_code(step.params(), sandbox, &cancel).await,
        DIAGNOSTIC_TOOL => {
            warn!(step = %step.id(), params = ?step.params(), "recorded unrecoverable failure");
            StepOutcome::Completed(json!({ "recorded": step.params() }))
        }
        tool => {
            tokio::select! {
                _ = cancel.cancelled() => StepOutcome::Interrupted,
                result = registry.invoke(tool, step.params()) => match result {
                    Ok(r) if r.success => StepOutcome::Completed(r.output),
                    Ok(r) => StepOutcome::Failed(FailureReason::from_tool_result(&r)),
                    Err(e) => StepOutcome::Failed(FailureReason::classified(
                        FailureClass::Unclassified,
                        e.to_string(),
                    )),
                },
            }
        }
    }
}

async fn run_code(params: &Params, sandbox: SandboxConfig, cancel: &CancellationToken) -> StepOutcome {
    let Some(code) = params.get("code").and_then(Value::as_str) else {
        return StepOutcome::Failed(FailureReason::classified(
            FailureClass::Unclassified,
            "run_code step has no 'code' parameter",
        ));
    };

    let mut session = match SandboxSession::open(sandbox) {
        Ok(session) => session,
        Err(e) => return StepOutcome::Fault(e.into()),
    };

    if let Some(Value::Object(inputs)) = params.get("inputs") {
        for (path, content) in inputs {
            let bytes = match content {
                Value::String(s) => s.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            };
            if let Err(e) = session.stage_input(path, &bytes).await {
                return match e {
                    SandboxError::InvalidConfig(msg) => StepOutcome::Failed(
                        FailureReason::classified(FailureClass::Unclassified, msg),
                    ),
                    other => StepOutcome::Fault(other.into()),
                };
            }
        }
    }

    let executed = session.execute_cancellable(code, cancel).await;
    if let Err(e) = session.close() {
        warn!(error = %e, "failed to remove sandbox working directory");
    }

    match executed {
        Ok(result) if result.success => match serde_json::to_value(&result) {
            Ok(value) => StepOutcome::Completed(value),
            Err(e) => StepOutcome::Failed(FailureReason::classified(
                FailureClass::Unclassified,
                format!("cannot encode sandbox result: {e}"),
            )),
        },
        Ok(result) => StepOutcome::Failed(FailureReason::from_execution(&result)),
        Err(SandboxError::Cancelled) => StepOutcome::Interrupted,
        Err(e) => StepOutcome::Fault(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tooling::{ParamType, ParameterSchema, Tool, ToolResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn parameter_schema(&self) -> ParameterSchema {
            ParameterSchema::new().optional("n", ParamType::Integer, "unused")
        }

        async fn invoke(&self, _params: &Params) -> ToolResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                ToolResult::err("connection reset by peer")
            } else {
                ToolResult::ok("ok")
            }
        }
    }

    /// Cancels the walk from inside its own step, then finishes anyway.
    struct CancelsWalk {
        token: CancellationToken,
        succeed: bool,
    }

    #[async_trait]
    impl Tool for CancelsWalk {
        fn name(&self) -> &str {
            "cancels_walk"
        }

        fn parameter_schema(&self) -> ParameterSchema {
            ParameterSchema::new()
        }

        async fn invoke(&self, _params: &Params) -> ToolResult {
            self.token.cancel();
            if self.succeed {
                ToolResult::ok("finished")
            } else {
                ToolResult::err("connection reset by peer")
            }
        }
    }

    fn walker(tool: impl Tool) -> PlanWalker {
        let mut registry = ToolRegistry::new();
        registry.register(tool).unwrap();
        PlanWalker::new(
            Arc::new(registry),
            SandboxConfig::default(),
            WalkConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_transient_failure_retries_once_and_completes() {
        let mut plan = ExecutionPlan::new("flaky", Params::new()).with_available_tools(&["flaky"]);
        let s1 = plan.add_step("flaky", Params::new(), "first", vec![]).unwrap();
        plan.add_step("flaky", Params::new(), "second", vec![s1]).unwrap();

        let (plan, report) = walker(Flaky { calls: AtomicUsize::new(0) })
            .run(plan, CancellationToken::new())
            .await
            .unwrap();

        assert!(report.outcome.is_completed(), "{:?}", report.outcome);
        assert_eq!(report.replans.len(), 1);
        assert_eq!(report.replans[0].reason.class, FailureClass::Transient);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.step(&StepId::nth(2)).unwrap().status(), StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_outcomes_finished_during_cancellation_are_kept() {
        let token = CancellationToken::new();
        let mut plan = ExecutionPlan::new("t", Params::new()).with_available_tools(&["cancels_walk"]);
        let s1 = plan.add_step("cancels_walk", Params::new(), "first", vec![]).unwrap();
        let s2 = plan.add_step("cancels_walk", Params::new(), "second", vec![s1.clone()]).unwrap();

        let (plan, report) = walker(CancelsWalk {
            token: token.clone(),
            succeed: true,
        })
        .run(plan, token)
        .await
        .unwrap();

        assert_eq!(plan.step(&s1).unwrap().status(), StepStatus::Completed);
        assert_eq!(plan.step(&s1).unwrap().result(), Some(&json!("finished")));
        assert_eq!(
            report.outcome,
            PlanOutcome::Cancelled {
                interrupted: vec![],
                pending: vec![s2],
            }
        );
    }

    #[tokio::test]
    async fn test_failures_during_cancellation_are_not_replanned() {
        let token = CancellationToken::new();
        let mut plan = ExecutionPlan::new("t", Params::new()).with_available_tools(&["cancels_walk"]);
        let s1 = plan.add_step("cancels_walk", Params::new(), "only", vec![]).unwrap();

        let (plan, report) = walker(CancelsWalk {
            token: token.clone(),
            succeed: false,
        })
        .run(plan, token)
        .await
        .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.step(&s1).unwrap().status(), StepStatus::Failed);
        assert!(report.replans.is_empty());
        assert_eq!(
            report.outcome,
            PlanOutcome::Cancelled {
                interrupted: vec![],
                pending: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let w = PlanWalker::new(
            Arc::new(ToolRegistry::new()),
            SandboxConfig::default(),
            WalkConfig {
                max_concurrent: 0,
                replan: true,
            },
        );
        let err = w
            .run(ExecutionPlan::new("t", Params::new()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WalkError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_and_gets_diagnostic() {
        let mut plan = ExecutionPlan::new("t", Params::new());
        plan.add_step("missing_tool", Params::new(), "x", vec![]).unwrap();
        let (plan, report) = PlanWalker::new(
            Arc::new(ToolRegistry::new()),
            SandboxConfig::default(),
            WalkConfig::default(),
        )
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(plan.steps()[1].tool(), DIAGNOSTIC_TOOL);
        assert_eq!(plan.steps()[1].status(), StepStatus::Completed);
        match report.outcome {
            PlanOutcome::Incomplete { failed, .. } => assert_eq!(failed, vec![StepId::nth(1)]),
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }
}
