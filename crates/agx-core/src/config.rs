//! File-based configuration: sandbox limits and walk tuning.
//!
//! ```toml
//! [sandbox]
//! timeout_secs = 10
//! memory_limit_bytes = 134217728
//! denied_capabilities = ["subprocess", "socket"]
//!
//! [walk]
//! max_concurrent = 2
//! ```
//!
//! Every key is optional; missing keys keep their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::SandboxConfig;
use crate::walk::WalkConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgxConfig {
    pub sandbox: SandboxConfig,
    pub walk: WalkConfig,
}

impl AgxConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.sandbox
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.walk.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "walk.max_concurrent must be > 0".into(),
            ));
        }
        Ok(())
    }
}
