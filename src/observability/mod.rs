//! Observability
//!
//! Structured run events and metrics for operational visibility.

pub mod audit;
pub mod metrics;
