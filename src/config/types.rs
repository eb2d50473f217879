/// Core types and structures for the gradebox system
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Timeout applied when the embedding UI does not configure one
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;

/// Language tag recorded when none is supplied
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// Language tags that name the single supported execution dialect
pub const RECOGNIZED_LANGUAGES: &[&str] = &["javascript", "js"];

/// Learner-supplied source text plus its display-only language tag
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Source text handed to the interpreter as-is
    pub source: String,
    /// Display metadata; the executor never dispatches on it
    pub language: String,
}

impl Submission {
    pub fn new(source: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            language: language.into(),
        }
    }
}

/// Tagged result of one execution attempt. Exactly one tag per run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Program ran to the end; `terminal_value` is absent for `undefined`
    Completed { terminal_value: Option<String> },
    /// Syntax or runtime error raised by the submission
    Threw { message: String },
    /// Watchdog fired before the program finished
    TimedOut,
}

impl ExecutionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ExecutionOutcome::Completed { .. } => OutcomeKind::Completed,
            ExecutionOutcome::Threw { .. } => OutcomeKind::Threw,
            ExecutionOutcome::TimedOut => OutcomeKind::TimedOut,
        }
    }
}

/// Payload-free outcome tag, used in reports, events and metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    Threw,
    TimedOut,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Completed => write!(f, "completed"),
            OutcomeKind::Threw => write!(f, "threw"),
            OutcomeKind::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Comparison result of normalized output against the expected output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No expected output configured
    #[default]
    NotApplicable,
    Correct,
    Incorrect,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::NotApplicable => write!(f, "not_applicable"),
            Verdict::Correct => write!(f, "correct"),
            Verdict::Incorrect => write!(f, "incorrect"),
        }
    }
}

/// Observable lifecycle state of a run session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Running,
    Settled,
}

/// Per-run interpreter and capture limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Maximum captured lines per run
    pub max_capture_lines: usize,
    /// Maximum captured bytes per run (sum of line lengths)
    pub max_capture_bytes: usize,
    /// Iterations a single loop may run before the engine raises an error
    /// inside the script. Time is bounded by the watchdog, not by this.
    pub loop_iteration_limit: u64,
    /// Maximum interpreter call depth
    pub recursion_limit: usize,
    /// Stack size of the evaluating thread inside the worker process (bytes)
    pub worker_stack_bytes: usize,
    /// Heap the worker process may allocate on top of what it inherits (bytes)
    pub max_memory_bytes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_capture_lines: 10_000,
            max_capture_bytes: 1024 * 1024, // 1 MB
            loop_iteration_limit: 250_000_000,
            recursion_limit: 512,
            worker_stack_bytes: 16 * 1024 * 1024, // 16 MB
            max_memory_bytes: 256 * 1024 * 1024,  // 256 MB
        }
    }
}

/// Session configuration, supplied once at session creation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Correlation id carried by every event of this session
    #[serde(default = "new_session_id")]
    pub session_id: String,
    /// Submission text restored by every reset
    pub initial_submission: String,
    /// Display-only language tag
    #[serde(default = "default_language")]
    pub language: String,
    /// Reference answer; `None` means every verdict is `NotApplicable`
    #[serde(default)]
    pub expected_output: Option<String>,
    /// Run time budget in milliseconds; `None` selects [`DEFAULT_TIMEOUT_MS`]
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub limits: ExecutionLimits,
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl SessionConfig {
    pub fn new(initial_submission: impl Into<String>) -> Self {
        Self {
            session_id: new_session_id(),
            initial_submission: initial_submission.into(),
            language: default_language(),
            expected_output: None,
            timeout_ms: None,
            limits: ExecutionLimits::default(),
        }
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Effective run time budget
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn initial_submission(&self) -> Submission {
        Submission::new(self.initial_submission.clone(), self.language.clone())
    }
}

/// Custom error types for gradebox
#[derive(Error, Debug)]
pub enum GradeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run rejected: run {active_run_id} is still in flight")]
    ConcurrentRunRejected { active_run_id: String },

    #[error("Run cancelled before completion")]
    Cancelled,

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for gradebox operations
pub type Result<T> = std::result::Result<T, GradeError>;
