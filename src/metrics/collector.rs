use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::report::{self, ProcessingReport};
use super::{MetricsSink, Phase};
use crate::types::{FileOutcome, OutcomeStatus};
use crate::utils::config::serialize_secs;

/// Point-in-time counters. Cheap to take at any moment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_files: u64,
    pub processed_files: u64,
    pub skipped_files: u64,
    pub failed_files: u64,
    pub processed_bytes: u64,
    pub current_concurrency: usize,
    pub peak_concurrency: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub files_per_sec: f64,
    pub bytes_per_sec: f64,
}

/// Lock-light statistics collector. Counters are atomics; outcomes go to one vector for the
/// final report.
pub struct MetricsCollector {
    started: Mutex<Instant>,
    total: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    concurrency: AtomicUsize,
    peak_concurrency: AtomicUsize,
    outcomes: Mutex<Vec<FileOutcome>>,
    phases: Mutex<BTreeMap<Phase, Duration>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector {
            started: Mutex::new(Instant::now()),
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            concurrency: AtomicUsize::new(0),
            peak_concurrency: AtomicUsize::new(0),
            outcomes: Mutex::new(Vec::new()),
            phases: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn current_metrics(&self) -> MetricsSnapshot {
        let elapsed = self.started.lock().unwrap().elapsed();
        let secs = elapsed.as_secs_f64();
        let processed = self.processed.load(Ordering::Acquire);
        let bytes = self.bytes.load(Ordering::Acquire);
        let per_sec = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        MetricsSnapshot {
            total_files: self.total.load(Ordering::Acquire),
            processed_files: processed,
            skipped_files: self.skipped.load(Ordering::Acquire),
            failed_files: self.failed.load(Ordering::Acquire),
            processed_bytes: bytes,
            current_concurrency: self.concurrency.load(Ordering::Acquire),
            peak_concurrency: self.peak_concurrency.load(Ordering::Acquire),
            elapsed,
            files_per_sec: per_sec(processed),
            bytes_per_sec: per_sec(bytes),
        }
    }

    /// Roll recorded outcomes up into a report. O(n) in the number of outcomes.
    pub fn generate_report(&self) -> ProcessingReport {
        let summary = self.current_metrics();
        let outcomes = self.outcomes.lock().unwrap().clone();
        let phases = self.phases.lock().unwrap().clone();
        report::build(summary, &outcomes, &phases)
    }

    /// Recorded outcomes, in recording order.
    pub fn outcomes(&self) -> Vec<FileOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        *self.started.lock().unwrap() = Instant::now();
        for c in [
            &self.total,
            &self.processed,
            &self.skipped,
            &self.failed,
            &self.bytes,
        ] {
            c.store(0, Ordering::Release);
        }
        self.concurrency.store(0, Ordering::Release);
        self.peak_concurrency.store(0, Ordering::Release);
        self.outcomes.lock().unwrap().clear();
        self.phases.lock().unwrap().clear();
    }
}

impl MetricsSink for MetricsCollector {
    fn record_file_processed(&self, outcome: FileOutcome) {
        self.total.fetch_add(1, Ordering::AcqRel);
        match &outcome.status {
            OutcomeStatus::Processed => {
                self.processed.fetch_add(1, Ordering::AcqRel);
                self.bytes.fetch_add(outcome.size, Ordering::AcqRel);
            }
            OutcomeStatus::Skipped { .. } => {
                self.skipped.fetch_add(1, Ordering::AcqRel);
            }
            OutcomeStatus::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.outcomes.lock().unwrap().push(outcome);
    }

    fn increment_concurrency(&self) {
        let now = self.concurrency.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_concurrency.fetch_max(now, Ordering::AcqRel);
    }

    fn decrement_concurrency(&self) {
        let _ = self
            .concurrency
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            });
    }

    fn record_phase(&self, phase: Phase, elapsed: Duration) {
        *self.phases.lock().unwrap().entry(phase).or_default() += elapsed;
    }
}
