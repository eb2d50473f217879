//! gradebox: run-scoped execution and auto-grading for interactive code widgets
//!
//! Learner-submitted source runs in a fresh embedded JavaScript interpreter
//! inside its own worker process, its output is captured in order, and the
//! result is graded against an optional reference answer.
//!
//! # Architecture
//!
//! ## Capture ([`utils`])
//! - [`utils::output`]: Run-scoped, ordered, bounded capture channel
//!
//! ## Interpreter ([`runtime`])
//! - [`runtime::isolate`]: Fresh context per run with only intrinsics and capture bindings
//!
//! ## Supervision ([`core`])
//! - [`core::supervisor`]: Worker process launch, watchdog, cancellation and reaping
//! - [`core::worker`]: Worker-side setup (fd closure, rlimits) and the frame protocol
//! - [`core::types`]: Launch requests and supervision results
//!
//! ## Execution ([`exec`])
//! - [`exec::executor`]: `execute(source, capture, timeout)` with a mandatory budget
//!
//! ## Grading ([`verdict`])
//! - [`verdict::normalize`]: Outcome and captured lines to one output string
//! - [`verdict::verdict`]: Trimmed, case-sensitive comparison
//!
//! ## Sessions ([`session`])
//! - [`session::run_session`]: Idle / Running / Settled lifecycle with run, reset and cancel
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured run events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Shared type definitions and the error type
//! - [`config::loader`]: JSON configuration loading
//! - [`config::validator`]: Fail-fast validation
//!
//! # Guarantees
//!
//! 1. **One channel per run** - output of an abandoned run never reaches a later one
//! 2. **Faults are output** - syntax errors, throws and timeouts become text, not `Err`
//! 3. **Timeouts are mandatory** - every run has a budget and a watchdog
//! 4. **Stopped means stopped** - a timed-out or cancelled worker is killed and reaped,
//!    and its heap is capped, so no submission can take the host down with it
//! 5. **Late results are discarded** - a reset or cancel supersedes the run generation

// Capture
pub mod utils;

// Interpreter
pub mod runtime;

// Supervision
pub mod core;

// Execution
pub mod exec;

// Grading
pub mod verdict;

// Sessions
pub mod session;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use exec::executor::SandboxExecutor;
pub use observability::audit::init_audit_log;
pub use session::run_session::{Lifecycle, RunReport, RunSession, RunTicket, SessionSnapshot};
pub use utils::output::{CaptureChannel, CaptureLimits, CaptureLog, OutputIntegrity};
pub use verdict::normalize::OutputNormalizer;
pub use verdict::verdict::VerdictComparator;
