use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `""` or `"local"` for the in-process engine.
    pub target: String,
    /// Attach `_output_shapes` to every node sent to the engine.
    pub infer_shapes: bool,
    /// Dead tensor handles are deleted in batches of this size.
    pub dead_handle_threshold: usize,
    pub default_device: String,
    pub log_device_placement: bool,
    pub operation_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            infer_shapes: false,
            dead_handle_threshold: 10,
            default_device: "/device:CPU:0".to_string(),
            log_device_placement: false,
            operation_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
