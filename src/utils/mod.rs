//! Utilities
//!
//! Run-scoped output capture.

pub mod output;
