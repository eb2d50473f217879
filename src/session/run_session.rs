/// Run session lifecycle: Idle -> Running -> Settled, with reset and cancel
use crate::config::types::{
    GradeError, LifecycleState, OutcomeKind, Result, SessionConfig, Submission, Verdict,
};
use crate::config::validator::validate_config;
use crate::core::types::{LaunchRequest, Supervision};
use crate::exec::executor::SandboxExecutor;
use crate::observability::audit::{events, CorrelationIds};
use crate::observability::metrics::get_metrics;
use crate::utils::output::{CaptureChannel, OutputIntegrity};
use crate::verdict::normalize::OutputNormalizer;
use crate::verdict::verdict::VerdictComparator;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Extra time `run_and_wait` allows past the run's own budget
const SETTLE_GRACE: Duration = Duration::from_secs(2);

/// Invoked once per settled run with the normalized output
pub type CompletionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by a successful `run()`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunTicket {
    pub run_id: String,
    pub generation: u64,
}

/// Everything known about a finished run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub output: String,
    pub verdict: Verdict,
    pub outcome: OutcomeKind,
    pub elapsed_ms: u64,
    pub output_integrity: OutputIntegrity,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running { run_id: String },
    Settled(RunReport),
}

impl Lifecycle {
    pub fn state(&self) -> LifecycleState {
        match self {
            Lifecycle::Idle => LifecycleState::Idle,
            Lifecycle::Running { .. } => LifecycleState::Running,
            Lifecycle::Settled(_) => LifecycleState::Settled,
        }
    }
}

/// Point-in-time view of a session for the UI
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub submission: String,
    pub language: String,
    /// Present only once a run has settled
    pub output: Option<String>,
    pub verdict: Verdict,
    pub state: LifecycleState,
    pub last_run_id: Option<String>,
}

struct ActiveRun {
    run_id: String,
    generation: u64,
    cancel_tx: Sender<()>,
    capture: CaptureChannel,
}

struct SessionInner {
    submission: Submission,
    lifecycle: Lifecycle,
    /// Bumped by every run start, reset and cancel
    generation: u64,
    active: Option<ActiveRun>,
    last_run_id: Option<String>,
    /// Run id and message of the last run lost to a host failure
    last_fault: Option<(String, String)>,
}

struct SessionShared {
    config: SessionConfig,
    executor: SandboxExecutor,
    callback: Option<CompletionCallback>,
    state: Mutex<SessionInner>,
    transitions: Condvar,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn correlation(&self, run_id: &str) -> CorrelationIds {
        CorrelationIds::new(self.config.session_id.clone()).with_run_id(run_id)
    }

    /// Close the active run's capture and signal its supervisor.
    /// The caller holds the lock and decides the next lifecycle state.
    fn cancel_locked(&self, inner: &mut SessionInner, reason: &str) -> bool {
        inner.generation += 1;
        match inner.active.take() {
            Some(active) => {
                active.capture.close();
                let _ = active.cancel_tx.send(());
                events::run_cancelled(self.correlation(&active.run_id), reason);
                true
            }
            None => false,
        }
    }

    fn settle(&self, generation: u64, report: RunReport) {
        let mut inner = self.lock();
        let current = inner
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !current || inner.generation != generation {
            drop(inner);
            get_metrics().stale_results_discarded.inc();
            events::stale_result_discarded(self.correlation(&report.run_id));
            return;
        }

        inner.active = None;
        inner.lifecycle = Lifecycle::Settled(report.clone());
        drop(inner);
        self.transitions.notify_all();

        get_metrics().record_verdict(report.verdict);
        events::run_settled(
            self.correlation(&report.run_id),
            report.outcome,
            report.verdict,
            report.elapsed_ms,
        );
        if let Some(callback) = &self.callback {
            callback(&report.output);
        }
    }

    fn abandon(&self, generation: u64, run_id: &str, error: &GradeError) {
        events::worker_fault(self.correlation(run_id), &error.to_string());

        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.active = None;
        inner.lifecycle = Lifecycle::Idle;
        inner.last_fault = Some((run_id.to_string(), error.to_string()));
        drop(inner);
        self.transitions.notify_all();
    }
}

/// Supervisor-thread body for one run
fn drive(
    shared: Arc<SessionShared>,
    req: LaunchRequest,
    capture: CaptureChannel,
    cancel_rx: Receiver<()>,
    generation: u64,
) {
    let started = Instant::now();
    let outcome = match shared.executor.execute_request(&req, &capture, &cancel_rx) {
        Ok(Supervision::Finished(outcome)) => outcome,
        Ok(Supervision::Cancelled) => {
            log::debug!("Run {} stopped by cancel signal", req.run_id);
            return;
        }
        Err(e) => {
            shared.abandon(generation, &req.run_id, &e);
            return;
        }
    };
    let elapsed = started.elapsed();
    let correlation = shared.correlation(&req.run_id);

    if outcome.kind() == OutcomeKind::TimedOut {
        events::run_timed_out(correlation.clone(), req.timeout.as_millis() as u64);
    }

    let log = capture.take_log();
    if log.integrity == OutputIntegrity::TruncatedByCaptureLimit {
        get_metrics().capture_truncated.inc();
        events::capture_truncated(correlation.clone(), log.lines.len(), log.bytes);
    }
    if log.late_drops > 0 {
        get_metrics().late_emissions_dropped.add(log.late_drops);
        events::late_emissions_dropped(correlation, log.late_drops);
    }

    let output = OutputNormalizer::normalize(&outcome, &log);
    let verdict = VerdictComparator::compare(&output, shared.config.expected_output.as_deref());

    shared.settle(
        generation,
        RunReport {
            run_id: req.run_id,
            output,
            verdict,
            outcome: outcome.kind(),
            elapsed_ms: elapsed.as_millis() as u64,
            output_integrity: log.integrity,
        },
    );
}

/// One code widget's run lifecycle.
///
/// `run()` returns immediately; the result arrives through the completion
/// callback and is visible in `snapshot()`. At most one run is in flight.
pub struct RunSession {
    shared: Arc<SessionShared>,
}

impl RunSession {
    /// Create a session in `Idle`. Invalid configuration is rejected here.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create a session whose settled runs are reported to `callback`
    pub fn with_completion<F>(config: SessionConfig, callback: F) -> Result<Self>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback: CompletionCallback = Arc::new(callback);
        Self::build(config, Some(callback))
    }

    fn build(config: SessionConfig, callback: Option<CompletionCallback>) -> Result<Self> {
        let validation = validate_config(&config)?;
        for warning in validation.warnings {
            log::warn!("Configuration warning: {}", warning);
        }

        let inner = SessionInner {
            submission: config.initial_submission(),
            lifecycle: Lifecycle::Idle,
            generation: 0,
            active: None,
            last_run_id: None,
            last_fault: None,
        };

        Ok(Self {
            shared: Arc::new(SessionShared {
                executor: SandboxExecutor::new(config.limits.clone()),
                config,
                callback,
                state: Mutex::new(inner),
                transitions: Condvar::new(),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.shared.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Start a run of the current submission.
    ///
    /// Rejected with `ConcurrentRunRejected` while another run is in
    /// flight; the in-flight run is unaffected.
    pub fn run(&self) -> Result<RunTicket> {
        let shared = &self.shared;
        let mut inner = shared.lock();

        if let Some(active_run_id) = inner.active.as_ref().map(|a| a.run_id.clone()) {
            drop(inner);
            get_metrics().runs_rejected.inc();
            events::concurrent_run_rejected(shared.correlation(&active_run_id));
            return Err(GradeError::ConcurrentRunRejected { active_run_id });
        }

        let generation = inner.generation + 1;
        let req = LaunchRequest::new(
            inner.submission.source.clone(),
            shared.config.timeout(),
            shared.config.limits.clone(),
        );
        let run_id = req.run_id.clone();
        let capture = shared.executor.new_capture();
        let (cancel_tx, cancel_rx) = bounded::<()>(1);

        let short_id: String = run_id.chars().take(8).collect();
        let run_shared = Arc::clone(shared);
        let run_capture = capture.clone();
        let source = req.source.clone();
        thread::Builder::new()
            .name(format!("gradebox-run-{short_id}"))
            .spawn(move || drive(run_shared, req, run_capture, cancel_rx, generation))
            .map_err(|e| {
                get_metrics().worker_faults.inc();
                log::error!("Failed to start run supervisor: {}", e);
                GradeError::Worker(format!("spawn(supervisor): {}", e))
            })?;

        // The supervisor cannot settle before we release the lock.
        inner.generation = generation;
        inner.active = Some(ActiveRun {
            run_id: run_id.clone(),
            generation,
            cancel_tx,
            capture,
        });
        inner.lifecycle = Lifecycle::Running {
            run_id: run_id.clone(),
        };
        inner.last_run_id = Some(run_id.clone());
        inner.last_fault = None;
        drop(inner);
        shared.transitions.notify_all();

        events::run_start(shared.correlation(&run_id), &source);
        Ok(RunTicket { run_id, generation })
    }

    /// Cancel any in-flight run, restore the original submission and
    /// clear output and verdict.
    pub fn reset(&self) {
        let mut inner = self.shared.lock();
        self.shared.cancel_locked(&mut inner, "reset");
        inner.submission = self.shared.config.initial_submission();
        inner.lifecycle = Lifecycle::Idle;
        inner.last_fault = None;
        drop(inner);
        self.shared.transitions.notify_all();
    }

    /// Cancel the in-flight run, keeping the submission as edited.
    /// Returns whether there was a run to cancel.
    pub fn cancel(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.active.is_none() {
            return false;
        }
        self.shared.cancel_locked(&mut inner, "cancel");
        inner.lifecycle = Lifecycle::Idle;
        drop(inner);
        self.shared.transitions.notify_all();
        true
    }

    /// Replace the submission text. A run already in flight keeps the
    /// text it started with.
    pub fn set_submission(&self, source: impl Into<String>) {
        self.shared.lock().submission.source = source.into();
    }

    pub fn submission(&self) -> Submission {
        self.shared.lock().submission.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lock().lifecycle.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lock().lifecycle.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.lock();
        let (output, verdict) = match &inner.lifecycle {
            Lifecycle::Settled(report) => (Some(report.output.clone()), report.verdict),
            _ => (None, Verdict::NotApplicable),
        };
        SessionSnapshot {
            submission: inner.submission.source.clone(),
            language: inner.submission.language.clone(),
            output,
            verdict,
            state: inner.lifecycle.state(),
            last_run_id: inner.last_run_id.clone(),
        }
    }

    /// Block until the session leaves `Running` or `limit` elapses, and
    /// return the lifecycle at that point.
    pub fn wait_for_settle(&self, limit: Duration) -> Lifecycle {
        let inner = self.shared.lock();
        let (inner, _) = self
            .shared
            .transitions
            .wait_timeout_while(inner, limit, |inner| {
                matches!(inner.lifecycle, Lifecycle::Running { .. })
            })
            .unwrap_or_else(PoisonError::into_inner);
        inner.lifecycle.clone()
    }

    /// Start a run and block until it settles.
    ///
    /// Returns `Cancelled` if the run is reset or cancelled away first.
    pub fn run_and_wait(&self) -> Result<RunReport> {
        let ticket = self.run()?;
        let limit = self.shared.config.timeout() + SETTLE_GRACE;

        let inner = self.shared.lock();
        let (inner, _) = self
            .shared
            .transitions
            .wait_timeout_while(inner, limit, |inner| {
                inner
                    .active
                    .as_ref()
                    .is_some_and(|active| active.run_id == ticket.run_id)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if let Lifecycle::Settled(report) = &inner.lifecycle {
            if report.run_id == ticket.run_id {
                return Ok(report.clone());
            }
        }
        if let Some((run_id, message)) = &inner.last_fault {
            if *run_id == ticket.run_id {
                return Err(GradeError::Worker(message.clone()));
            }
        }
        if inner
            .active
            .as_ref()
            .is_some_and(|active| active.run_id == ticket.run_id)
        {
            return Err(GradeError::Worker(format!(
                "run {} did not settle within {:?}",
                ticket.run_id, limit
            )));
        }
        Err(GradeError::Cancelled)
    }
}

impl Drop for RunSession {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if self.shared.cancel_locked(&mut inner, "session dropped") {
            inner.lifecycle = Lifecycle::Idle;
        }
    }
}
