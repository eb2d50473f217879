/// Configuration loading from JSON
use crate::config::types::{GradeError, Result, SessionConfig};
use std::path::Path;

impl SessionConfig {
    /// Parse a session configuration from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GradeError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Load a session configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GradeError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json_str(&config_content)
    }
}
