/// Output normalization
/// Folds a run's outcome and captured lines into the single string that is
/// shown to the learner and graded.
use crate::config::types::ExecutionOutcome;
use crate::utils::output::{CaptureLog, OutputIntegrity};

/// Prefix of the line describing an error or timeout
pub const ERROR_PREFIX: &str = "Error: ";

/// Final line of a run that hit its time budget
pub const TIMEOUT_MARKER: &str = "Error: execution exceeded its time budget";

/// Line placed after the captured lines when the capture limit was hit
pub const TRUNCATION_NOTICE: &str = "[output truncated: capture limit reached]";

pub struct OutputNormalizer;

impl OutputNormalizer {
    pub fn normalize(outcome: &ExecutionOutcome, log: &CaptureLog) -> String {
        let mut lines: Vec<String> = log.lines.clone();

        if log.integrity == OutputIntegrity::TruncatedByCaptureLimit {
            lines.push(TRUNCATION_NOTICE.to_string());
        }

        match outcome {
            ExecutionOutcome::Completed { terminal_value } => {
                if let Some(value) = terminal_value {
                    lines.push(value.clone());
                }
            }
            ExecutionOutcome::Threw { message } => {
                lines.push(format!("{ERROR_PREFIX}{message}"));
            }
            ExecutionOutcome::TimedOut => lines.push(TIMEOUT_MARKER.to_string()),
        }

        lines.join("\n")
    }
}
