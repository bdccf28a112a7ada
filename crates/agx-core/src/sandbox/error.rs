//! Error types for the sandbox module.

use super::result::TerminationReason;

/// Errors produced by the sandbox layer.
///
/// Problems inside the executed code are never errors; they come back as an
/// unsuccessful [`ExecutionResult`](super::ExecutionResult).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("sandbox infrastructure fault: {context}: {source}")]
    Infrastructure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox execution cancelled")]
    Cancelled,
}

impl SandboxError {
    pub fn infrastructure(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Infrastructure {
            context: context.into(),
            source,
        }
    }

    /// Termination reason to report when the error ends a run.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        match self {
            SandboxError::Infrastructure { .. } => Some(TerminationReason::InternalError),
            _ => None,
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
