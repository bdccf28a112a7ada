//! Sandbox limits and interpreter settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{SandboxError, SandboxResult};

/// Limits applied to every execution in one session.
///
/// The session keeps its own copy, so changing a config after
/// [`SandboxSession::open`](super::SandboxSession::open) has no effect on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock limit per execution (seconds).
    pub timeout_secs: f64,
    /// Memory ceiling (bytes).
    pub memory_limit_bytes: u64,
    /// Per-stream capture cap (bytes).
    pub max_output_bytes: usize,
    /// Module or attribute names the code may not reference.
    pub denied_capabilities: Vec<String>,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// Kill the run once either stream exceeds `max_output_bytes`.
    pub kill_on_output_overflow: bool,
    /// How often the resident-set size is sampled (milliseconds).
    pub memory_poll_ms: u64,
    /// Parent directory for session working directories. System temp if unset.
    pub work_root: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30.0,
            memory_limit_bytes: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            denied_capabilities: [
                "os.system",
                "subprocess",
                "socket",
                "requests",
                "urllib",
                "ftplib",
                "telnetlib",
                "smtplib",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-u".to_string()],
            kill_on_output_overflow: false,
            memory_poll_ms: 50,
            work_root: None,
        }
    }
}

impl SandboxConfig {
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_denied(mut self, names: &[&str]) -> Self {
        self.denied_capabilities = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    /// Saturates at `Duration::MAX` for values `validate` would reject.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.memory_poll_ms.max(1))
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(SandboxError::InvalidConfig(format!(
                "timeout_secs must be a positive number, got {}",
                self.timeout_secs
            )));
        }
        if Duration::try_from_secs_f64(self.timeout_secs).is_err() {
            return Err(SandboxError::InvalidConfig(format!(
                "timeout_secs is too large to represent, got {}",
                self.timeout_secs
            )));
        }
        if self.memory_limit_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "memory_limit_bytes must be > 0".into(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_output_bytes must be > 0".into(),
            ));
        }
        if self.interpreter.trim().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "interpreter must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.timeout_secs, 30.0);
        assert_eq!(cfg.memory_limit_bytes, 268_435_456);
        assert_eq!(cfg.max_output_bytes, 1_048_576);
        assert!(cfg.denied_capabilities.iter().any(|d| d == "subprocess"));
        assert_eq!(cfg.interpreter, "python3");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_positive_limits() {
        assert!(SandboxConfig::default()
            .with_timeout_secs(0.0)
            .validate()
            .is_err());
        assert!(SandboxConfig::default()
            .with_timeout_secs(f64::NAN)
            .validate()
            .is_err());
        assert!(SandboxConfig::default()
            .with_memory_limit_bytes(0)
            .validate()
            .is_err());
        assert!(SandboxConfig::default()
            .with_max_output_bytes(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_oversized_timeout_is_rejected_without_panicking() {
        let cfg = SandboxConfig::default().with_timeout_secs(1e20);
        assert!(matches!(cfg.validate(), Err(SandboxError::InvalidConfig(_))));
        assert_eq!(cfg.timeout(), Duration::MAX);

        let cfg: SandboxConfig = toml::from_str("timeout_secs = 1e20\n").unwrap();
        assert!(cfg.validate().is_err());

        let cfg = SandboxConfig::default().with_timeout_secs(86_400.0 * 365.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: SandboxConfig = toml::from_str("timeout_secs = 2.5\n").unwrap();
        assert_eq!(cfg.timeout(), Duration::from_millis(2500));
        assert_eq!(cfg.max_output_bytes, 1_048_576);
    }
}
