//! Worker process for one run
//!
//! The supervisor forks one worker per run. The worker keeps only the frame
//! pipe, caps its own heap and CPU time, evaluates the submission on a thread
//! with the configured stack and streams captured lines and the final
//! outcome back as JSON lines. It never returns into the caller's code:
//! every path ends in `_exit`.
//!
//! Between `fork()` and `_exit` the worker must not touch anything the
//! parent's other threads may have been holding: no `log`, no metrics, no
//! stdio.

use crate::config::types::{ExecutionLimits, ExecutionOutcome, GradeError, Result};
use crate::core::supervisor::INTERNAL_FAULT_MESSAGE;
use crate::core::types::LaunchRequest;
use crate::runtime::isolate;
use crate::utils::output::{CaptureChannel, CaptureLimits, Forwarded};
use nix::fcntl::{open, OFlag};
use nix::sys::prctl;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, getppid, Pid};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Descriptor the frame pipe occupies inside the worker
const FRAME_FD: RawFd = 3;

/// One line of the frame pipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// A line the worker's capture channel accepted
    Line { text: String },
    /// The worker's capture channel hit its limit
    Truncated,
    /// How the script ended; the last frame of a healthy worker
    Outcome { outcome: ExecutionOutcome },
    /// The worker could not set itself up
    Fault { message: String },
}

impl WorkerFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)
            .map_err(|e| GradeError::Worker(format!("failed to encode worker frame: {e}")))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| GradeError::Worker(format!("malformed worker frame: {e}")))
    }
}

struct FrameWriter {
    file: File,
}

impl FrameWriter {
    fn send(&self, frame: &WorkerFrame) {
        if let Ok(bytes) = frame.encode() {
            // A supervisor that stopped reading is about to kill us anyway.
            let _ = (&self.file).write_all(&bytes);
        }
    }
}

/// Worker entrypoint, called in the child right after `fork()`.
///
/// `frame_fd` is the write end of the frame pipe; `parent` is the pid the
/// supervisor had before forking.
pub fn run_worker_child(req: &LaunchRequest, frame_fd: RawFd, parent: Pid) -> ! {
    // The default hook writes through std's stderr lock, which another
    // thread of the parent may have held at fork time.
    std::panic::set_hook(Box::new(|_| {}));

    if frame_fd != FRAME_FD {
        if dup2(frame_fd, FRAME_FD).is_err() {
            exit_worker(1);
        }
        let _ = close(frame_fd);
    }
    // SAFETY: FRAME_FD was just installed above and nothing else owns it.
    let writer = Arc::new(FrameWriter {
        file: unsafe { File::from_raw_fd(FRAME_FD) },
    });

    let code = match prepare_worker(parent, &req.limits, req.timeout) {
        Ok(()) => match evaluate_on_worker_thread(&req.source, &req.limits, &writer) {
            Ok(outcome) => {
                writer.send(&WorkerFrame::Outcome { outcome });
                0
            }
            Err(e) => {
                writer.send(&WorkerFrame::Fault {
                    message: e.to_string(),
                });
                1
            }
        },
        Err(e) => {
            writer.send(&WorkerFrame::Fault {
                message: e.to_string(),
            });
            1
        }
    };
    exit_worker(code)
}

fn exit_worker(code: i32) -> ! {
    // SAFETY: _exit skips atexit handlers and destructors that belong to
    // the parent's copy of the process state.
    unsafe { libc::_exit(code) }
}

fn to_setup_error(prefix: &str, err: impl std::fmt::Display) -> GradeError {
    GradeError::Worker(format!("{prefix}: {err}"))
}

fn prepare_worker(parent: Pid, limits: &ExecutionLimits, timeout: Duration) -> Result<()> {
    prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| to_setup_error("prctl(pdeathsig)", e))?;
    // The supervisor thread may have exited between fork and prctl.
    if getppid() != parent {
        return Err(GradeError::Worker("supervisor exited before setup".to_string()));
    }

    redirect_stdio()?;
    close_inherited_fds()?;
    apply_resource_limits(limits, timeout)
}

fn redirect_stdio() -> Result<()> {
    let null = open("/dev/null", OFlag::O_RDWR, Mode::empty())
        .map_err(|e| to_setup_error("open(/dev/null)", e))?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup2(null, target).map_err(|e| to_setup_error("dup2(stdio)", e))?;
    }
    if null > libc::STDERR_FILENO && null != FRAME_FD {
        let _ = close(null);
    }
    Ok(())
}

/// Close everything above the frame pipe
fn close_inherited_fds() -> Result<()> {
    let first = (FRAME_FD + 1) as libc::c_uint;
    // SAFETY: close_range only closes descriptors; no memory is touched.
    let rc = unsafe { libc::syscall(libc::SYS_close_range, first, libc::c_uint::MAX, 0) };
    if rc == 0 {
        return Ok(());
    }

    // Pre-5.9 kernels: collect first, since reading the directory holds an fd.
    let entries =
        fs::read_dir("/proc/self/fd").map_err(|e| to_setup_error("read_dir(/proc/self/fd)", e))?;
    let fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<RawFd>().ok())
        .filter(|fd| *fd > FRAME_FD)
        .collect();
    for fd in fds {
        let _ = close(fd);
    }
    Ok(())
}

fn apply_resource_limits(limits: &ExecutionLimits, timeout: Duration) -> Result<()> {
    set_limit("RLIMIT_CORE", Resource::RLIMIT_CORE, 0, 0)?;

    // Backstop for the watchdog: SIGXCPU one second past the budget.
    let cpu_seconds = timeout.as_secs() + 1;
    set_limit("RLIMIT_CPU", Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1)?;

    let data = inherited_data_bytes()
        .saturating_add(limits.worker_stack_bytes as u64)
        .saturating_add(limits.max_memory_bytes);
    set_limit("RLIMIT_DATA", Resource::RLIMIT_DATA, data, data)
}

/// Lower a limit; never asks for more than the current hard limit
fn set_limit(name: &str, resource: Resource, soft: u64, hard: u64) -> Result<()> {
    let (_, current_hard) = getrlimit(resource).map_err(|e| to_setup_error(name, e))?;
    let hard = hard.min(current_hard);
    let soft = soft.min(hard);
    setrlimit(resource, soft, hard).map_err(|e| to_setup_error(name, e))
}

/// Private writable memory the worker inherited from the host
fn inherited_data_bytes() -> u64 {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("VmData:"))
                .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        })
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

fn evaluate_on_worker_thread(
    source: &str,
    limits: &ExecutionLimits,
    writer: &Arc<FrameWriter>,
) -> Result<ExecutionOutcome> {
    let tap_writer = Arc::clone(writer);
    let capture = CaptureChannel::with_tap(
        CaptureLimits {
            max_lines: limits.max_capture_lines,
            max_bytes: limits.max_capture_bytes,
        },
        move |event| match event {
            Forwarded::Line(text) => tap_writer.send(&WorkerFrame::Line {
                text: text.to_string(),
            }),
            Forwarded::Truncated => tap_writer.send(&WorkerFrame::Truncated),
        },
    );

    let source = source.to_string();
    let limits = limits.clone();
    let evaluator = thread::Builder::new()
        .name("gradebox-eval".to_string())
        .stack_size(limits.worker_stack_bytes)
        .spawn(move || {
            catch_unwind(AssertUnwindSafe(|| {
                isolate::evaluate(&source, &capture, &limits)
            }))
            .unwrap_or_else(|_| Ok(internal_fault()))
        })
        .map_err(|e| to_setup_error("spawn(evaluator)", e))?;

    evaluator.join().unwrap_or_else(|_| Ok(internal_fault()))
}

fn internal_fault() -> ExecutionOutcome {
    ExecutionOutcome::Threw {
        message: INTERNAL_FAULT_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let line = WorkerFrame::Line {
            text: "a\nb".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        // Embedded newlines stay escaped, so one frame is one line.
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let outcome = WorkerFrame::Outcome {
            outcome: ExecutionOutcome::TimedOut,
        };
        let text = String::from_utf8(outcome.encode().unwrap()).unwrap();
        assert!(text.contains("\"frame\":\"outcome\""));
        assert_eq!(WorkerFrame::decode(text.trim_end()).unwrap(), outcome);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let err = WorkerFrame::decode("{\"frame\":\"li").unwrap_err();
        assert!(matches!(err, GradeError::Worker(_)));
    }

    #[test]
    fn test_inherited_data_bytes_reads_status() {
        assert!(inherited_data_bytes() > 0);
    }
}
