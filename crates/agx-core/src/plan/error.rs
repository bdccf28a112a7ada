//! Error types for plan construction and repair.

use super::step::{StepId, StepStatus};

/// Planning faults. These abort plan construction or repair and are surfaced
/// to the caller; ordinary step failures are recorded on the step instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("no available tool can serve task '{task}'")]
    NoUsableTool { task: String },

    #[error("step '{step}' has unknown dependency '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("step '{step}' depends on itself")]
    SelfDependency { step: StepId },

    #[error("dependency cycle detected through step '{step}'")]
    CycleDetected { step: StepId },

    #[error("duplicate step id '{step}'")]
    DuplicateStep { step: StepId },

    #[error("step not found: {step}")]
    UnknownStep { step: StepId },

    #[error("step '{step}' cannot move from {from} to {to}")]
    InvalidTransition {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("step '{step}' is {status}, only failed steps can be replanned")]
    StepNotFailed { step: StepId, status: StepStatus },

    #[error("step '{step}' was already superseded by '{recovery}'")]
    AlreadyReplanned { step: StepId, recovery: StepId },

    #[error("recovery step '{step}' failed; recovery budget for '{original}' is exhausted")]
    RecoveryExhausted { step: StepId, original: StepId },

    #[error("splicing recovery for '{step}' would create a cycle via '{via}'")]
    WouldCreateCycle { step: StepId, via: StepId },
}

/// Result type for plan operations.
pub type PlanResult<T> = std::result::Result<T, PlanningError>;
