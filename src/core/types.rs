use crate::config::types::{ExecutionLimits, ExecutionOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything the supervisor needs to start one run's worker.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub run_id: String,
    pub source: String,
    pub timeout: Duration,
    pub limits: ExecutionLimits,
}

impl LaunchRequest {
    pub fn new(source: impl Into<String>, timeout: Duration, limits: ExecutionLimits) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            timeout,
            limits,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

/// How supervision of one run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Supervision {
    /// Worker reported, or the watchdog fired (`TimedOut`)
    Finished(ExecutionOutcome),
    /// Cancel signal arrived first; no outcome is produced
    Cancelled,
}

impl Supervision {
    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        match self {
            Supervision::Finished(outcome) => Some(outcome),
            Supervision::Cancelled => None,
        }
    }
}
