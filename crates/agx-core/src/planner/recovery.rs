//! Failure classification and single-shot plan repair.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::METRICS;
use crate::obs;
use crate::plan::{
    ExecutionPlan, Params, PlanResult, PlanningError, RecoveryInfo, RecoveryStrategy, StepId,
    StepStatus,
};
use crate::sandbox::{ExecutionResult, TerminationReason};
use crate::tooling::ToolResult;

use super::{DIAGNOSTIC_TOOL, SEARCH_TOOL};

/// Coarse failure taxonomy used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// A file, path or named resource does not exist.
    NotFound,
    /// Worth retrying unchanged (timeouts, dropped connections).
    Transient,
    Unclassified,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::NotFound => "not_found",
            FailureClass::Transient => "transient",
            FailureClass::Unclassified => "unclassified",
        }
    }
}

/// Why a step failed, with its class already decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub class: FailureClass,
    pub message: String,
}

impl FailureReason {
    /// Structured class supplied by the tool layer.
    pub fn classified(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Class inferred from prose.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify_message(&message),
            message,
        }
    }

    /// Prefer the tool's own classification; fall back to the error text.
    pub fn from_tool_result(result: &ToolResult) -> Self {
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "tool reported failure".to_string());
        match result.failure_class {
            Some(class) => Self::classified(class, message),
            None => Self::from_message(message),
        }
    }

    /// Timeouts are transient; other limit violations and user-code errors
    /// are unclassified.
    pub fn from_execution(result: &ExecutionResult) -> Self {
        let message = if result.stderr.trim().is_empty() {
            format!("sandbox run ended: {}", result.termination_reason)
        } else {
            last_line(&result.stderr).to_string()
        };
        let class = match result.termination_reason {
            TerminationReason::Timeout => FailureClass::Transient,
            _ => FailureClass::Unclassified,
        };
        Self::classified(class, message)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.class.as_str())
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or(text)
        .trim()
}

/// Classify a failure message by keyword.
pub fn classify_message(message: &str) -> FailureClass {
    let msg = message.to_lowercase();

    if msg.contains("not found")
        || msg.contains("no such file")
        || msg.contains("does not exist")
        || msg.contains("filenotfound")
        || msg.contains("enoent")
    {
        return FailureClass::NotFound;
    }
    if msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("temporarily unavailable")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("try again")
    {
        return FailureClass::Transient;
    }
    FailureClass::Unclassified
}

/// Name to search for when a step could not find its resource.
fn missing_resource_name(params: &Params) -> Option<String> {
    if let Some(Value::String(path)) = params.get("path") {
        let base = path
            .rsplit(['/', '\\'])
            .find(|seg| !seg.is_empty())
            .unwrap_or(path.as_str());
        if !base.is_empty() {
            return Some(base.to_string());
        }
    }
    ["pattern", "name", "old_name"]
        .iter()
        .find_map(|k| params.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Splice one recovery step for a failed step.
///
/// Returns the id of the inserted step. Each step is replanned at most once;
/// a failed recovery step is never itself recovered.
pub fn replan_on_failure(
    plan: &mut ExecutionPlan,
    failed: &StepId,
    reason: &FailureReason,
) -> PlanResult<StepId> {
    let step = plan
        .step(failed)
        .ok_or_else(|| PlanningError::UnknownStep {
            step: failed.clone(),
        })?
        .clone();

    if step.status() != StepStatus::Failed {
        return Err(PlanningError::StepNotFailed {
            step: failed.clone(),
            status: step.status(),
        });
    }
    if let Some(recovery) = step.superseded_by() {
        return Err(PlanningError::AlreadyReplanned {
            step: failed.clone(),
            recovery: recovery.clone(),
        });
    }
    if let Some(info) = step.recovery() {
        return Err(PlanningError::RecoveryExhausted {
            step: failed.clone(),
            original: info.supersedes.clone(),
        });
    }

    let search_target = match reason.class {
        FailureClass::NotFound if plan.has_tool(SEARCH_TOOL) => missing_resource_name(step.params()),
        _ => None,
    };

    let (strategy, tool, params, description) = match (reason.class, search_target) {
        (FailureClass::NotFound, Some(name)) => (
            RecoveryStrategy::Search,
            SEARCH_TOOL.to_string(),
            Params::from([
                ("pattern".to_string(), Value::from(name.clone())),
                ("file_pattern".to_string(), Value::from("*")),
            ]),
            format!("Search for missing resource: {name}"),
        ),
        (FailureClass::Transient, _) => (
            RecoveryStrategy::Retry,
            step.tool().to_string(),
            step.params().clone(),
            format!("Retry: {}", step.description()),
        ),
        _ => (
            RecoveryStrategy::Diagnostic,
            DIAGNOSTIC_TOOL.to_string(),
            Params::from([
                ("failed_step".to_string(), Value::from(failed.to_string())),
                ("tool".to_string(), Value::from(step.tool())),
                ("class".to_string(), Value::from(reason.class.as_str())),
                ("reason".to_string(), Value::from(reason.message.clone())),
            ]),
            format!("Record failure of {failed}: {}", reason.message),
        ),
    };

    let recovery = plan.splice_recovery(
        failed,
        tool,
        params,
        description,
        step.depends_on().to_vec(),
        RecoveryInfo {
            supersedes: failed.clone(),
            strategy,
        },
    )?;

    METRICS.inc_recoveries();
    obs::emit_replanned(
        &plan.id().to_string(),
        failed,
        &recovery,
        strategy_name(strategy),
    );
    Ok(recovery)
}

fn strategy_name(strategy: RecoveryStrategy) -> &'static str {
    match strategy {
        RecoveryStrategy::Search => "search",
        RecoveryStrategy::Retry => "retry",
        RecoveryStrategy::Diagnostic => "diagnostic",
    }
}
