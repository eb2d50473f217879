//! Execution control
//!
//! Runs one submission under a watchdog and reports its outcome.

pub mod executor;
