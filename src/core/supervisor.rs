use crate::config::types::{ExecutionOutcome, GradeError, Result};
use crate::core::types::{LaunchRequest, Supervision};
use crate::core::worker::{run_worker_child, WorkerFrame};
use crate::utils::output::CaptureChannel;
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getpid, pipe2, ForkResult, Pid};
use std::cell::Cell;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

/// Message used when the interpreter itself misbehaves
pub const INTERNAL_FAULT_MESSAGE: &str = "internal fault: interpreter stopped without a result";

/// Message used when the worker process ran out of its heap budget
pub const MEMORY_EXHAUSTED_MESSAGE: &str = "execution exceeded its memory budget";

type WorkerReport = Result<ExecutionOutcome>;

fn to_worker_error(prefix: &str, err: impl std::fmt::Display) -> GradeError {
    GradeError::Worker(format!("{prefix}: {err}"))
}

/// A forked worker process and the receiving end of its report.
///
/// Dropping the handle kills and reaps the process if supervision did not.
pub struct WorkerHandle {
    run_id: String,
    pid: Pid,
    report_rx: Receiver<WorkerReport>,
    started: Instant,
    reaped: Cell<bool>,
}

impl WorkerHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// SIGKILL the worker and reap it. Safe to call on an exited worker:
    /// the zombie keeps its original status until reaped.
    fn terminate(&self) -> Option<WaitStatus> {
        if self.reaped.replace(true) {
            return None;
        }

        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("kill({}) for run {} failed: {}", self.pid, self.run_id, e),
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => return Some(status),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("waitpid({}) for run {} failed: {}", self.pid, self.run_id, e);
                    return None;
                }
            }
        }
    }

    /// Reap the worker and turn its report, or its death, into a result
    fn finish(&self, report: Option<WorkerReport>) -> Result<Supervision> {
        let status = self.terminate();
        match report {
            Some(report) => report.map(Supervision::Finished),
            None => Ok(Supervision::Finished(self.classify_exit(status))),
        }
    }

    /// Outcome for a worker that closed its pipe without reporting
    fn classify_exit(&self, status: Option<WaitStatus>) -> ExecutionOutcome {
        match status {
            Some(WaitStatus::Signaled(_, Signal::SIGXCPU, _)) => {
                log::warn!("Worker for run {} hit its CPU limit", self.run_id);
                ExecutionOutcome::TimedOut
            }
            // Allocation failure aborts the process.
            Some(WaitStatus::Signaled(_, Signal::SIGABRT, _)) => {
                log::warn!("Worker for run {} exhausted its memory budget", self.run_id);
                ExecutionOutcome::Threw {
                    message: MEMORY_EXHAUSTED_MESSAGE.to_string(),
                }
            }
            other => {
                log::error!(
                    "Worker for run {} exited without a report: {:?}",
                    self.run_id,
                    other
                );
                ExecutionOutcome::Threw {
                    message: INTERNAL_FAULT_MESSAGE.to_string(),
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Fork the worker process for `req` and start relaying its frames.
///
/// Lines the worker accepts are emitted into `capture` in order; the
/// outcome (or setup fault) is delivered to the handle's report channel.
pub fn spawn_worker(req: &LaunchRequest, capture: &CaptureChannel) -> Result<WorkerHandle> {
    let (frame_read, frame_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| to_worker_error("pipe(frames)", e))?;
    let parent = getpid();

    // SAFETY: the child only runs `run_worker_child`, which never returns
    // into this function and ends in `_exit`.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(frame_read);
            run_worker_child(req, frame_write.as_raw_fd(), parent)
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(to_worker_error("fork(worker)", e)),
    };
    drop(frame_write);

    let (report_tx, report_rx) = bounded::<WorkerReport>(1);
    let worker = WorkerHandle {
        run_id: req.run_id.clone(),
        pid,
        report_rx,
        started: Instant::now(),
        reaped: Cell::new(false),
    };

    let frames = File::from(frame_read);
    let reader_capture = capture.clone();
    let run_id = req.run_id.clone();
    let short_id: String = req.run_id.chars().take(8).collect();
    thread::Builder::new()
        .name(format!("gradebox-frames-{short_id}"))
        .spawn(move || relay_frames(frames, &reader_capture, &report_tx, &run_id))
        .map_err(|e| to_worker_error("spawn(frame reader)", e))?;

    log::debug!("Run {} started in worker process {}", worker.run_id, pid);
    Ok(worker)
}

/// Feed worker frames into `capture` until the outcome arrives or the pipe
/// closes. A closed pipe without an outcome drops `report_tx` unsent.
fn relay_frames(
    frames: File,
    capture: &CaptureChannel,
    report_tx: &Sender<WorkerReport>,
    run_id: &str,
) {
    for line in BufReader::new(frames).lines() {
        let Ok(line) = line else { break };
        match WorkerFrame::decode(&line) {
            Ok(WorkerFrame::Line { text }) => {
                capture.emit(text);
            }
            Ok(WorkerFrame::Truncated) => capture.mark_truncated(),
            Ok(WorkerFrame::Outcome { outcome }) => {
                let _ = report_tx.send(Ok(outcome));
                return;
            }
            Ok(WorkerFrame::Fault { message }) => {
                let _ = report_tx.send(Err(GradeError::Worker(message)));
                return;
            }
            // A worker killed mid-write leaves a partial last line.
            Err(e) => {
                log::debug!("Run {}: {}", run_id, e);
                break;
            }
        }
    }
}

/// Wait for the worker, the watchdog or a cancel signal, whichever is first.
///
/// On timeout or cancellation the capture channel is closed and the worker
/// process is killed and reaped before returning. A report that is already
/// waiting when the deadline fires still wins. A disconnected `cancel`
/// counts as a cancel: whoever could have sent it is gone.
pub fn supervise(
    worker: WorkerHandle,
    capture: &CaptureChannel,
    timeout: Duration,
    cancel: &Receiver<()>,
) -> Result<Supervision> {
    let deadline = after(timeout);

    select! {
        recv(worker.report_rx) -> report => worker.finish(report.ok()),
        recv(cancel) -> _ => {
            capture.close();
            worker.terminate();
            log::debug!("Run {} cancelled after {:?}", worker.run_id, worker.elapsed());
            Ok(Supervision::Cancelled)
        },
        recv(deadline) -> _ => {
            if let Ok(report) = worker.report_rx.try_recv() {
                return worker.finish(Some(report));
            }
            capture.close();
            worker.terminate();
            log::warn!(
                "Run {} exceeded its {:?} budget, worker {} killed",
                worker.run_id,
                timeout,
                worker.pid
            );
            Ok(Supervision::Finished(ExecutionOutcome::TimedOut))
        },
    }
}

/// Spawn and supervise in one step
pub fn launch_with_supervisor(
    req: &LaunchRequest,
    capture: &CaptureChannel,
    cancel: &Receiver<()>,
) -> Result<Supervision> {
    let worker = spawn_worker(req, capture)?;
    supervise(worker, capture, req.timeout, cancel)
}
