//! Sandboxed execution of one submission with a mandatory time budget

use crate::config::types::{ExecutionLimits, ExecutionOutcome, GradeError, Result};
use crate::core::supervisor::launch_with_supervisor;
use crate::core::types::{LaunchRequest, Supervision};
use crate::observability::metrics::get_metrics;
use crate::utils::output::{CaptureChannel, CaptureLimits};
use crossbeam_channel::{never, Receiver};
use std::time::{Duration, Instant};

/// Runs submissions in a fresh interpreter inside a dedicated worker process
#[derive(Clone, Debug, Default)]
pub struct SandboxExecutor {
    limits: ExecutionLimits,
}

impl SandboxExecutor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Capture channel sized by this executor's limits, for one run
    pub fn new_capture(&self) -> CaptureChannel {
        CaptureChannel::new(CaptureLimits {
            max_lines: self.limits.max_capture_lines,
            max_bytes: self.limits.max_capture_bytes,
        })
    }

    /// Execute `source`, emitting into `capture`, within `timeout`.
    ///
    /// Faults in the submission come back as `Ok(Threw)` or
    /// `Ok(TimedOut)`; `Err` means the host could not run it at all.
    pub fn execute(
        &self,
        source: &str,
        capture: &CaptureChannel,
        timeout: Duration,
    ) -> Result<ExecutionOutcome> {
        match self.execute_cancellable(source, capture, timeout, &never())? {
            Supervision::Finished(outcome) => Ok(outcome),
            Supervision::Cancelled => Err(GradeError::Cancelled),
        }
    }

    /// Like [`execute`](Self::execute), but also stops when `cancel`
    /// receives a message or its sender is dropped.
    pub fn execute_cancellable(
        &self,
        source: &str,
        capture: &CaptureChannel,
        timeout: Duration,
        cancel: &Receiver<()>,
    ) -> Result<Supervision> {
        self.execute_request(
            &LaunchRequest::new(source, timeout, self.limits.clone()),
            capture,
            cancel,
        )
    }

    /// Execute a prepared launch request (the run id is kept for logs)
    pub fn execute_request(
        &self,
        req: &LaunchRequest,
        capture: &CaptureChannel,
        cancel: &Receiver<()>,
    ) -> Result<Supervision> {
        if req.timeout.is_zero() {
            return Err(GradeError::Config("timeout cannot be zero".to_string()));
        }

        let metrics = get_metrics();
        metrics.active_runs.inc();
        let started = Instant::now();
        let result = launch_with_supervisor(req, capture, cancel);
        metrics.active_runs.dec();

        match &result {
            Ok(Supervision::Finished(outcome)) => {
                metrics.record_outcome(outcome.kind(), started.elapsed());
            }
            Ok(Supervision::Cancelled) => metrics.runs_cancelled.inc(),
            Err(e) => {
                metrics.worker_faults.inc();
                log::error!("Run {} could not be executed: {}", req.run_id, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(ExecutionLimits::default())
    }

    #[test]
    fn test_execute_completed() {
        let executor = executor();
        let capture = executor.new_capture();
        let outcome = executor
            .execute("emit('a'); emit('b')", &capture, Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed { terminal_value: None });
        assert_eq!(capture.take_log().lines, vec!["a", "b"]);
    }

    #[test]
    fn test_execute_timed_out() {
        let executor = executor();
        let capture = executor.new_capture();
        let outcome = executor
            .execute("for (;;) {}", &capture, Duration::from_millis(150))
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
    }

    #[test]
    fn test_execute_rejects_zero_timeout() {
        let executor = executor();
        let capture = executor.new_capture();
        let err = executor
            .execute("1", &capture, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, GradeError::Config(_)));
    }

    #[test]
    fn test_execute_cancellable_cancelled() {
        let executor = executor();
        let capture = executor.new_capture();
        let (cancel_tx, cancel_rx) = bounded(1);
        cancel_tx.send(()).unwrap();
        let result = executor
            .execute_cancellable("while (true) {}", &capture, Duration::from_secs(5), &cancel_rx)
            .unwrap();
        assert_eq!(result, Supervision::Cancelled);
    }

    #[test]
    fn test_new_capture_uses_limits() {
        let executor = SandboxExecutor::new(ExecutionLimits {
            max_capture_lines: 3,
            max_capture_bytes: 99,
            ..ExecutionLimits::default()
        });
        let limits = executor.new_capture().limits();
        assert_eq!(limits.max_lines, 3);
        assert_eq!(limits.max_bytes, 99);
    }

    #[test]
    fn test_each_capture_is_fresh() {
        let executor = executor();
        let first = executor.new_capture();
        executor
            .execute("emit('one')", &first, Duration::from_secs(5))
            .unwrap();
        let second = executor.new_capture();
        assert!(second.is_empty());
    }
}
