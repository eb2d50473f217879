//! Run supervision core.
//!
//! Each run executes in a forked worker process. `supervisor` owns the
//! fork, the watchdog/cancel select and the kill-and-reap; `worker` is
//! what the child runs until it exits. Interpreter setup lives in `runtime`.

pub mod supervisor;
pub mod types;
pub mod worker;
