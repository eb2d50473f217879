// Config validation
// Session construction validates config and fails fast with actionable errors

use crate::config::types::{GradeError, Result, SessionConfig, RECOGNIZED_LANGUAGES};

/// Smallest worker stack the interpreter can start on
const MIN_WORKER_STACK_BYTES: usize = 256 * 1024;
/// Below this the interpreter cannot even build its intrinsics
const MIN_MEMORY_BYTES: u64 = 16 * 1024 * 1024;

/// Timeouts above this are legal but make a stuck widget feel frozen
const LONG_TIMEOUT_MS: u64 = 30_000;

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a session config. Errors are fatal; warnings are returned.
pub fn validate_config(config: &SessionConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_timeout(config, &mut result);
    validate_limits(config, &mut result);
    validate_grading(config, &mut result);

    if !result.is_valid() {
        let error_msg = format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        );
        return Err(GradeError::Config(error_msg));
    }

    Ok(result)
}

fn validate_timeout(config: &SessionConfig, result: &mut ValidationResult) {
    if let Some(timeout_ms) = config.timeout_ms {
        if timeout_ms == 0 {
            result.add_error("timeout_ms cannot be zero".to_string());
        } else if timeout_ms > LONG_TIMEOUT_MS {
            result.add_warning(format!(
                "timeout_ms {} is above {} ms, a runaway submission will hold the widget that long",
                timeout_ms, LONG_TIMEOUT_MS
            ));
        }
    }
}

fn validate_limits(config: &SessionConfig, result: &mut ValidationResult) {
    let limits = &config.limits;

    if limits.max_capture_lines == 0 {
        result.add_error("limits.max_capture_lines cannot be zero".to_string());
    }
    if limits.max_capture_bytes == 0 {
        result.add_error("limits.max_capture_bytes cannot be zero".to_string());
    }
    if limits.loop_iteration_limit == 0 {
        result.add_error("limits.loop_iteration_limit cannot be zero".to_string());
    }
    if limits.recursion_limit == 0 {
        result.add_error("limits.recursion_limit cannot be zero".to_string());
    }
    if limits.max_memory_bytes < MIN_MEMORY_BYTES {
        result.add_error(format!(
            "limits.max_memory_bytes {} is below the {} byte minimum",
            limits.max_memory_bytes, MIN_MEMORY_BYTES
        ));
    }
    if limits.worker_stack_bytes < MIN_WORKER_STACK_BYTES {
        result.add_error(format!(
            "limits.worker_stack_bytes {} is below the {} byte minimum",
            limits.worker_stack_bytes, MIN_WORKER_STACK_BYTES
        ));
    }
}

fn validate_grading(config: &SessionConfig, result: &mut ValidationResult) {
    let language = config.language.to_lowercase();
    if !RECOGNIZED_LANGUAGES.contains(&language.as_str()) {
        result.add_warning(format!(
            "language '{}' is not recognized, submissions still run as JavaScript",
            config.language
        ));
    }

    if let Some(expected) = &config.expected_output {
        if expected.trim().is_empty() {
            result.add_warning(
                "expected_output is blank, only runs with no output will grade correct"
                    .to_string(),
            );
        }
    }
}
