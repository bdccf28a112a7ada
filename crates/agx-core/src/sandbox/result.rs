//! Structured outcome of one sandbox execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// The process exited on its own, successfully or not.
    Normal,
    Timeout,
    MemoryExceeded,
    DeniedCapability,
    OutputExceeded,
    InternalError,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Normal => "normal",
            TerminationReason::Timeout => "timeout",
            TerminationReason::MemoryExceeded => "memory-exceeded",
            TerminationReason::DeniedCapability => "denied-capability",
            TerminationReason::OutputExceeded => "output-exceeded",
            TerminationReason::InternalError => "internal-error",
        }
    }

    /// Stopped by a resource limit or the denylist.
    pub fn is_limit_violation(self) -> bool {
        matches!(
            self,
            TerminationReason::Timeout
                | TerminationReason::MemoryExceeded
                | TerminationReason::DeniedCapability
                | TerminationReason::OutputExceeded
        )
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    /// Either stream hit the output cap.
    pub truncated: bool,
    pub termination_reason: TerminationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    /// A run that never started because `detail` explains why.
    pub(crate) fn rejected(
        termination_reason: TerminationReason,
        detail: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: detail.into(),
            duration_seconds: elapsed.as_secs_f64(),
            truncated: false,
            termination_reason,
            exit_code: None,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_seconds.max(0.0))
    }
}
