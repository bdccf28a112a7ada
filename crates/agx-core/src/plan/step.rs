//! Step identity, status state machine, and recovery bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter mapping handed to a tool: string keys to opaque JSON values.
pub type Params = BTreeMap<String, Value>;

/// Unique identity of a step within one plan (`step_1`, `step_2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Id for the `n`-th step created in a plan (1-based).
    pub fn nth(n: usize) -> Self {
        Self(format!("step_{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Step lifecycle: `Pending -> Running -> {Completed | Failed}`.
///
/// `Completed` and `Failed` are absorbing. A failed step is never retried in
/// place; replanning supersedes it with a fresh `Pending` recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a recovery step tries to remedy the step it supersedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Locate a missing resource with the `search` tool.
    Search,
    /// Re-run the same tool with the same parameters.
    Retry,
    /// Record the failure for the caller; no remediation.
    Diagnostic,
}

impl RecoveryStrategy {
    /// Whether completing this recovery satisfies dependents of the failed step.
    pub fn is_remedial(self) -> bool {
        !matches!(self, RecoveryStrategy::Diagnostic)
    }
}

/// Marker carried by a recovery step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// The failed step this recovery supersedes.
    pub supersedes: StepId,
    pub strategy: RecoveryStrategy,
}

/// One tool invocation within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    id: StepId,
    tool: String,
    params: Params,
    description: String,
    depends_on: Vec<StepId>,
    status: StepStatus,
    result: Option<Value>,
    error: Option<String>,
    recovery: Option<RecoveryInfo>,
    superseded_by: Option<StepId>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Step {
    /// A fresh `Pending` step. Duplicate dependency ids are collapsed,
    /// keeping first-seen order.
    pub fn new(
        id: StepId,
        tool: impl Into<String>,
        params: Params,
        description: impl Into<String>,
        depends_on: Vec<StepId>,
    ) -> Self {
        let mut deps: Vec<StepId> = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        Self {
            id,
            tool: tool.into(),
            params,
            description: description.into(),
            depends_on: deps,
            status: StepStatus::Pending,
            result: None,
            error: None,
            recovery: None,
            superseded_by: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn depends_on(&self) -> &[StepId] {
        &self.depends_on
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn recovery(&self) -> Option<&RecoveryInfo> {
        self.recovery.as_ref()
    }

    pub fn superseded_by(&self) -> Option<&StepId> {
        self.superseded_by.as_ref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// A failed step that can no longer be recovered: it was already
    /// superseded, or it is itself a recovery step.
    pub fn is_terminal_failure(&self) -> bool {
        self.status == StepStatus::Failed
            && (self.superseded_by.is_some() || self.recovery.is_some())
    }

    pub(crate) fn set_status(&mut self, status: StepStatus, at: DateTime<Utc>) {
        match status {
            StepStatus::Running => self.started_at = Some(at),
            StepStatus::Completed | StepStatus::Failed => self.finished_at = Some(at),
            StepStatus::Pending => {}
        }
        self.status = status;
    }

    pub(crate) fn set_result(&mut self, result: Value) {
        self.result = Some(result);
    }

    pub(crate) fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub(crate) fn set_recovery(&mut self, recovery: RecoveryInfo) {
        self.recovery = Some(recovery);
    }

    pub(crate) fn set_superseded_by(&mut self, recovery: StepId) {
        self.superseded_by = Some(recovery);
    }

    /// Copy of this step with one parameter set; used to hand inputs to a worker.
    pub(crate) fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub(crate) fn add_dependency(&mut self, dep: StepId) {
        if !self.depends_on.contains(&dep) {
            self.depends_on.push(dep);
        }
    }
}
