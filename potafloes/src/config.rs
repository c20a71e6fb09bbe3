//! Context configuration parsing.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Behaviour knobs for a [`Context`](crate::Context)
///
/// ```yaml
/// name: pipeline
/// abandon_parked: true
/// capture_panics: true
/// warn_pending_queries: false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Name used in logs, task names and error messages
    #[serde(default = "default_name")]
    pub name: String,

    /// Abort tasks that are parked on engine futures nobody can resolve
    /// once the rest of the graph has settled. When false, `finalize`
    /// returns and leaves them suspended.
    ///
    /// A task counts as parked while any parked wait inside it is pending,
    /// so other work joined or selected with that wait is abandoned too.
    /// The `*_unparked` waits keep such tasks draining instead.
    #[serde(default = "default_true")]
    pub abandon_parked: bool,

    /// Record task panics as `TaskPanicked` errors instead of letting
    /// them unwind into the runtime.
    #[serde(default = "default_true")]
    pub capture_panics: bool,

    /// Warn about unresolved queries when an entity context freezes
    #[serde(default = "default_true")]
    pub warn_pending_queries: bool,
}

fn default_name() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            abandon_parked: true,
            capture_panics: true,
            warn_pending_queries: true,
        }
    }
}

impl ContextConfig {
    /// Default configuration with a custom context name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ContextConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("context name is empty".into()));
        }
        Ok(())
    }
}
