//! Server configuration loading.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// `maestro.yaml` layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the capability index JSON file.
    pub capability_index: PathBuf,
    /// Root directory of the artifact tree.
    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: PathBuf,
    /// In-flight node cap per run.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// Global in-flight tool process cap across runs.
    #[serde(default = "default_max_tool_processes")]
    pub max_tool_processes: usize,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_artifacts_root() -> PathBuf {
    PathBuf::from("./artifacts")
}

fn default_max_parallel_nodes() -> usize {
    4
}

fn default_max_tool_processes() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load and validate the server configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ServerConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.capability_index.as_os_str().is_empty() {
        return Err(ConfigError::Invalid(
            "capability_index must not be empty".to_string(),
        ));
    }
    if config.artifacts_root.as_os_str().is_empty() {
        return Err(ConfigError::Invalid(
            "artifacts_root must not be empty".to_string(),
        ));
    }
    if config.max_parallel_nodes == 0 {
        return Err(ConfigError::Invalid(
            "max_parallel_nodes must be > 0".to_string(),
        ));
    }
    if config.max_tool_processes == 0 {
        return Err(ConfigError::Invalid(
            "max_tool_processes must be > 0".to_string(),
        ));
    }
    Ok(())
}
