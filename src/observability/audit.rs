/// Run event logging for gradebox
/// Structured lifecycle events for every run, routed through `log` and
/// optionally appended to a JSON-lines audit file.
///
/// Events never carry submission text, only its SHA-256 digest.
use crate::config::types::{GradeError, OutcomeKind, Result, Verdict};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

/// Run event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunSeverity {
    High,
    Medium,
    Low,
}

/// Types of run events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEventType {
    RunStart,
    RunSettled,
    RunTimedOut,
    RunCancelled,
    ConcurrentRunRejected,
    CaptureTruncated,
    LateEmissionsDropped,
    StaleResultDiscarded,
    WorkerFault,
}

impl RunEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> RunSeverity {
        match self {
            RunEventType::RunStart => RunSeverity::Low,
            RunEventType::RunSettled => RunSeverity::Low,
            RunEventType::RunCancelled => RunSeverity::Low,
            RunEventType::StaleResultDiscarded => RunSeverity::Low,
            RunEventType::LateEmissionsDropped => RunSeverity::Low,

            RunEventType::RunTimedOut => RunSeverity::Medium,
            RunEventType::ConcurrentRunRejected => RunSeverity::Medium,
            RunEventType::CaptureTruncated => RunSeverity::Medium,

            RunEventType::WorkerFault => RunSeverity::High,
        }
    }
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Owning session
    pub session_id: String,
    /// Specific run within the session, absent for session-level events
    pub run_id: Option<String>,
}

impl CorrelationIds {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            run_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Hex SHA-256 of submission text
pub fn source_digest(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Individual run event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: RunEventType,
    pub severity: RunSeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub source_digest: Option<String>,
    pub outcome: Option<OutcomeKind>,
    pub verdict: Option<Verdict>,
    pub elapsed_ms: Option<u64>,
}

impl RunEvent {
    /// Create a new run event with default severity
    pub fn new(event_type: RunEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now(),
            details: details.into(),
            correlation: None,
            source_digest: None,
            outcome: None,
            verdict: None,
            elapsed_ms: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Attach the digest of `source`; the text itself is not stored
    pub fn with_source(mut self, source: &str) -> Self {
        self.source_digest = Some(source_digest(source));
        self
    }

    pub fn with_outcome(mut self, outcome: OutcomeKind) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn with_severity(mut self, severity: RunSeverity) -> Self {
        self.severity = severity;
        self
    }

    fn to_json_line(&self) -> serde_json::Value {
        let timestamp_ms = self
            .timestamp
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut entry = serde_json::json!({
            "timestamp": timestamp_ms,
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
        });

        if let Some(correlation) = &self.correlation {
            entry["correlation"] = serde_json::json!({
                "session_id": correlation.session_id,
                "run_id": correlation.run_id,
            });
        }
        if let Some(digest) = &self.source_digest {
            entry["source_sha256"] = serde_json::json!(digest);
        }
        if let Some(outcome) = self.outcome {
            entry["outcome"] = serde_json::json!(outcome);
        }
        if let Some(verdict) = self.verdict {
            entry["verdict"] = serde_json::json!(verdict);
        }
        if let Some(elapsed_ms) = self.elapsed_ms {
            entry["elapsed_ms"] = serde_json::json!(elapsed_ms);
        }
        entry
    }
}

fn log_to_facade(event: &RunEvent) {
    let run_id = event
        .correlation
        .as_ref()
        .and_then(|c| c.run_id.as_deref())
        .unwrap_or("-");
    match event.severity {
        RunSeverity::High => error!("{:?} [run {}] {}", event.event_type, run_id, event.details),
        RunSeverity::Medium => warn!("{:?} [run {}] {}", event.event_type, run_id, event.details),
        RunSeverity::Low => info!("{:?} [run {}] {}", event.event_type, run_id, event.details),
    }
}

/// Appends run events to a JSON-lines file
pub struct AuditLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: impl AsRef<Path>) -> Result<Self> {
        let audit_path = audit_path.as_ref().to_path_buf();

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GradeError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| GradeError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path,
        })
    }

    pub fn log_run_event(&self, event: &RunEvent) {
        log_to_facade(event);

        let line = event.to_json_line();
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    error!("Failed to write to audit log: {}", e);
                }
            }
            Err(_) => error!("Failed to acquire lock on audit file"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

/// Global audit logger instance
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Route run events to a JSON-lines file in addition to `log`.
/// Only the first successful call takes effect.
pub fn init_audit_log(audit_path: impl AsRef<Path>) -> Result<()> {
    let logger = AuditLogger::new(audit_path)?;
    if AUDIT_LOGGER.set(logger).is_err() {
        warn!("Audit logger already initialized");
    } else {
        info!("Audit logger initialized");
    }
    Ok(())
}

/// Log a run event using the global logger, or `log` alone if none is set
pub fn log_run_event(event: RunEvent) {
    match AUDIT_LOGGER.get() {
        Some(logger) => logger.log_run_event(&event),
        None => log_to_facade(&event),
    }
}

/// Convenience functions for lifecycle events
pub mod events {
    use super::*;

    pub fn run_start(correlation: CorrelationIds, source: &str) {
        log_run_event(
            RunEvent::new(RunEventType::RunStart, "Run started")
                .with_correlation(correlation)
                .with_source(source),
        );
    }

    pub fn run_settled(
        correlation: CorrelationIds,
        outcome: OutcomeKind,
        verdict: Verdict,
        elapsed_ms: u64,
    ) {
        log_run_event(settled_event(correlation, outcome, verdict, elapsed_ms));
    }

    /// Settled runs that faulted are surfaced at warn level
    pub(super) fn settled_event(
        correlation: CorrelationIds,
        outcome: OutcomeKind,
        verdict: Verdict,
        elapsed_ms: u64,
    ) -> RunEvent {
        let severity = match outcome {
            OutcomeKind::Completed => RunSeverity::Low,
            OutcomeKind::Threw | OutcomeKind::TimedOut => RunSeverity::Medium,
        };
        RunEvent::new(
            RunEventType::RunSettled,
            format!("Run settled: {} / {}", outcome, verdict),
        )
        .with_severity(severity)
        .with_correlation(correlation)
        .with_outcome(outcome)
        .with_verdict(verdict)
        .with_elapsed_ms(elapsed_ms)
    }

    pub fn run_timed_out(correlation: CorrelationIds, limit_ms: u64) {
        log_run_event(
            RunEvent::new(
                RunEventType::RunTimedOut,
                format!("Run exceeded its {} ms budget", limit_ms),
            )
            .with_correlation(correlation)
            .with_outcome(OutcomeKind::TimedOut)
            .with_elapsed_ms(limit_ms),
        );
    }

    pub fn run_cancelled(correlation: CorrelationIds, reason: &str) {
        log_run_event(
            RunEvent::new(RunEventType::RunCancelled, format!("Run cancelled: {}", reason))
                .with_correlation(correlation),
        );
    }

    pub fn concurrent_run_rejected(correlation: CorrelationIds) {
        log_run_event(
            RunEvent::new(
                RunEventType::ConcurrentRunRejected,
                "Run requested while another run is in flight",
            )
            .with_correlation(correlation),
        );
    }

    pub fn capture_truncated(correlation: CorrelationIds, lines: usize, bytes: usize) {
        log_run_event(
            RunEvent::new(
                RunEventType::CaptureTruncated,
                format!("Capture limit reached after {} lines / {} bytes", lines, bytes),
            )
            .with_correlation(correlation),
        );
    }

    pub fn late_emissions_dropped(correlation: CorrelationIds, count: u64) {
        log_run_event(
            RunEvent::new(
                RunEventType::LateEmissionsDropped,
                format!("Dropped {} emissions after capture closed", count),
            )
            .with_correlation(correlation),
        );
    }

    pub fn stale_result_discarded(correlation: CorrelationIds) {
        log_run_event(
            RunEvent::new(
                RunEventType::StaleResultDiscarded,
                "Result arrived for a superseded run",
            )
            .with_correlation(correlation),
        );
    }

    pub fn worker_fault(correlation: CorrelationIds, error: &str) {
        log_run_event(
            RunEvent::new(RunEventType::WorkerFault, format!("Worker fault: {}", error))
                .with_correlation(correlation),
        );
    }
}
