//! Run-scoped capture channel with bounded collection
//!
//! Every run gets its own channel. On the host side the frame reader holds
//! one handle and the supervisor another; closing the channel from the
//! supervisor side is how a timed-out or cancelled run loses its voice.
//! Inside the worker process a tapped channel enforces the same limits and
//! forwards what it accepts.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Capture limits configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    /// Maximum number of captured lines
    pub max_lines: usize,
    /// Maximum captured bytes (sum of line lengths)
    pub max_bytes: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        CaptureLimits {
            max_lines: 10_000,
            max_bytes: 1024 * 1024, // 1 MB
        }
    }
}

/// Whether the captured log is everything the program emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputIntegrity {
    #[default]
    Complete,
    TruncatedByCaptureLimit,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByCaptureLimit => write!(f, "truncated_by_capture_limit"),
        }
    }
}

/// Result of a single emit call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    /// Line appended to the log
    Accepted,
    /// Limit reached; line dropped
    Truncated,
    /// Run is over; line dropped
    Closed,
}

/// What a tap sees: accepted lines, then at most one truncation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded<'a> {
    Line(&'a str),
    Truncated,
}

/// Observer called under the channel lock, in emission order
pub type CaptureTap = Arc<dyn Fn(Forwarded<'_>) + Send + Sync>;

/// Ordered lines captured during one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureLog {
    pub lines: Vec<String>,
    pub integrity: OutputIntegrity,
    /// Bytes held in `lines`
    pub bytes: usize,
    /// Emissions that arrived after the channel closed
    pub late_drops: u64,
}

#[derive(Debug)]
struct CaptureState {
    log: CaptureLog,
    closed: bool,
}

/// Append-only line sink scoped to exactly one run
#[derive(Clone)]
pub struct CaptureChannel {
    limits: CaptureLimits,
    state: Arc<Mutex<CaptureState>>,
    tap: Option<CaptureTap>,
}

impl std::fmt::Debug for CaptureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureChannel")
            .field("limits", &self.limits)
            .field("state", &self.state)
            .field("tapped", &self.tap.is_some())
            .finish()
    }
}

impl CaptureChannel {
    pub fn new(limits: CaptureLimits) -> Self {
        CaptureChannel {
            limits,
            state: Arc::new(Mutex::new(CaptureState {
                log: CaptureLog::default(),
                closed: false,
            })),
            tap: None,
        }
    }

    /// Channel that also reports every accepted line to `tap`
    pub fn with_tap<F>(limits: CaptureLimits, tap: F) -> Self
    where
        F: Fn(Forwarded<'_>) + Send + Sync + 'static,
    {
        let tap: CaptureTap = Arc::new(tap);
        CaptureChannel {
            tap: Some(tap),
            ..Self::new(limits)
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        // A panicking emitter cannot leave the log half-written, so the
        // data behind a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one line, preserving emission order
    pub fn emit(&self, line: impl Into<String>) -> EmitStatus {
        let mut state = self.lock();
        if state.closed {
            state.log.late_drops += 1;
            return EmitStatus::Closed;
        }
        if state.log.integrity == OutputIntegrity::TruncatedByCaptureLimit {
            return EmitStatus::Truncated;
        }

        let line = line.into();
        if state.log.lines.len() >= self.limits.max_lines
            || state.log.bytes + line.len() > self.limits.max_bytes
        {
            state.log.integrity = OutputIntegrity::TruncatedByCaptureLimit;
            if let Some(tap) = &self.tap {
                tap(Forwarded::Truncated);
            }
            return EmitStatus::Truncated;
        }

        if let Some(tap) = &self.tap {
            tap(Forwarded::Line(&line));
        }
        state.log.bytes += line.len();
        state.log.lines.push(line);
        EmitStatus::Accepted
    }

    /// Record that the producer hit its own capture limit.
    /// No effect once the channel is closed.
    pub fn mark_truncated(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.log.integrity = OutputIntegrity::TruncatedByCaptureLimit;
        }
    }

    /// Stop accepting lines. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the channel and hand back everything captured so far
    pub fn take_log(&self) -> CaptureLog {
        let mut state = self.lock();
        state.closed = true;
        let late_drops = state.log.late_drops;
        let mut log = std::mem::take(&mut state.log);
        // Keep counting drops that land after the handoff.
        state.log.late_drops = late_drops;
        log.late_drops = late_drops;
        log
    }

    pub fn len(&self) -> usize {
        self.lock().log.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limits(&self) -> CaptureLimits {
        self.limits
    }
}
