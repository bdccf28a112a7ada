//! Task planner: turns a task description into an execution plan and
//! repairs plans when a step fails.
//!
//! - [`intent`]   — closed `TaskIntent` set with keyword classification and templates
//! - [`recovery`] — `FailureClass` / `FailureReason` and `replan_on_failure`

pub mod intent;
pub mod recovery;

use serde_json::Value;
use tracing::debug;

use crate::metrics::METRICS;
use crate::obs;
use crate::plan::{ExecutionPlan, Params, PlanGap, PlanResult, PlanningError, StepId};

pub use intent::{TaskIntent, TemplateStep};
pub use recovery::{classify_message, replan_on_failure, FailureClass, FailureReason};

pub const SEARCH_TOOL: &str = "search";
pub const FILE_READ_TOOL: &str = "file_read";
pub const FILE_WRITE_TOOL: &str = "file_write";
pub const SHELL_TOOL: &str = "shell";
/// Steps with this tool are executed in the sandbox, not the tool registry.
pub const RUN_CODE_TOOL: &str = "run_code";
/// No-op recovery step that only records a failure.
pub const DIAGNOSTIC_TOOL: &str = "diagnostic";

/// Fallback tool preference when no intent template applies.
const FALLBACK_PREFERENCE: [&str; 2] = [SHELL_TOOL, RUN_CODE_TOOL];

/// Stateless plan builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskPlanner;

impl TaskPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Build a plan for `task` using only tools in `available_tools`.
    ///
    /// A recognized intent yields its template, cut at the first step whose
    /// tool is unavailable (recorded as a [`PlanGap`]). When no template step
    /// is usable, a single fallback step is planned.
    pub fn plan<S: AsRef<str>>(
        &self,
        task: &str,
        context: &Params,
        available_tools: &[S],
    ) -> PlanResult<ExecutionPlan> {
        let mut plan =
            ExecutionPlan::new(task, context.clone()).with_available_tools(available_tools);
        let intent = TaskIntent::classify(task, context);
        debug!(task = %task, intent = ?intent, "classified task");

        if let Some(intent) = intent {
            let template = intent.template(context);
            let usable = template
                .iter()
                .take_while(|s| plan.has_tool(s.tool))
                .count();

            if usable < template.len() {
                plan.record_gap(PlanGap {
                    intent: intent.to_string(),
                    missing_tool: template[usable].tool.to_string(),
                    omitted: template[usable..]
                        .iter()
                        .map(|s| s.description.clone())
                        .collect(),
                });
            }

            if usable > 0 {
                insert_template(&mut plan, &template[..usable])?;
                finish(&plan, intent.as_str());
                return Ok(plan);
            }
        }

        let tool = fallback_tool(plan.available_tools()).ok_or_else(|| {
            PlanningError::NoUsableTool {
                task: task.to_string(),
            }
        })?;
        let params = fallback_params(&tool, task, context);
        plan.add_step(tool, params, format!("Execute: {task}"), vec![])?;
        finish(&plan, "fallback");
        Ok(plan)
    }

    /// See [`recovery::replan_on_failure`].
    pub fn replan_on_failure(
        &self,
        plan: &mut ExecutionPlan,
        failed: &StepId,
        reason: &FailureReason,
    ) -> PlanResult<StepId> {
        replan_on_failure(plan, failed, reason)
    }
}

fn insert_template(plan: &mut ExecutionPlan, steps: &[TemplateStep]) -> PlanResult<()> {
    let mut previous: Option<StepId> = None;
    for step in steps {
        let mut params = step.params.clone();
        let mut deps = Vec::new();
        if let Some(prev) = &previous {
            if step.after_previous {
                deps.push(prev.clone());
            }
            if step.input_from_previous {
                params.insert("from_step".to_string(), Value::from(prev.to_string()));
            }
        }
        let id = plan.add_step(step.tool, params, step.description.clone(), deps)?;
        previous = Some(id);
    }
    Ok(())
}

fn fallback_tool(available: &[String]) -> Option<String> {
    FALLBACK_PREFERENCE
        .iter()
        .find(|pref| available.iter().any(|t| t == *pref))
        .map(|t| t.to_string())
        .or_else(|| available.first().cloned())
}

fn fallback_params(tool: &str, task: &str, context: &Params) -> Params {
    match tool {
        SHELL_TOOL => Params::from([(
            "command".to_string(),
            context
                .get("command")
                .cloned()
                .unwrap_or_else(|| Value::from(task)),
        )]),
        RUN_CODE_TOOL => Params::from([(
            "code".to_string(),
            context
                .get("code")
                .cloned()
                .unwrap_or_else(|| Value::from(task)),
        )]),
        _ => context.clone(),
    }
}

fn finish(plan: &ExecutionPlan, intent: &str) {
    METRICS.inc_plans_built();
    obs::emit_plan_built(
        &plan.id().to_string(),
        intent,
        plan.len(),
        plan.gaps().len(),
        &plan.summary().digest(),
    );
}
