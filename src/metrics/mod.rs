//! Per-file outcomes and phase timings, recorded off the data path.

mod collector;
mod report;

use serde::Serialize;
use std::time::Duration;

use crate::types::FileOutcome;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use report::{FileSummary, ProcessingReport};

/// Run phases timed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Collection,
    Admission,
    Processing,
    Finalization,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Collection => "collection",
            Phase::Admission => "admission",
            Phase::Processing => "processing",
            Phase::Finalization => "finalization",
        }
    }
}

/// Where workers report outcomes. Called from every worker for every file, so implementations
/// must be cheap and thread-safe.
pub trait MetricsSink: Send + Sync {
    fn record_file_processed(&self, outcome: FileOutcome);
    fn increment_concurrency(&self);
    fn decrement_concurrency(&self);
    fn record_phase(&self, phase: Phase, elapsed: Duration);
}
