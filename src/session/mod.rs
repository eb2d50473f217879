//! Run sessions
//!
//! The per-widget state machine that ties execution, normalization and
//! grading together.

pub mod run_session;
