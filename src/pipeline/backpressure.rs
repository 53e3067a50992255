//! Backpressure: bounded stage queues plus a throttle on the producer when the estimate of
//! content held in flight grows past a threshold.
//!
//! The estimate is a heuristic: bytes of rendered content reserved by workers and not yet
//! released by the writer. It is re-evaluated only every `memory_check_interval` submissions.

use crossbeam_channel::{Sender, bounded};
use log::debug;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::WriteRequest;
use crate::pipeline::context::{CancelReason, ProcessingContext};
use crate::resource::ResourceMonitor;
use crate::types::Queue;
use crate::utils::config::BackpressureConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackpressureStats {
    pub enabled: bool,
    /// Files submitted through [`BackpressureManager::should_apply_backpressure`].
    pub files_processed: u64,
    pub current_memory_usage: u64,
    /// Configured threshold for the estimate.
    pub max_memory_usage: u64,
    pub peak_memory_usage: u64,
    pub backoff_events: u64,
}

pub struct BackpressureManager {
    config: BackpressureConfig,
    monitor: Option<Arc<ResourceMonitor>>,
    files_submitted: AtomicU64,
    memory_in_flight: AtomicU64,
    peak_memory: AtomicU64,
    engaged: AtomicBool,
    backoff_events: AtomicU64,
}

impl BackpressureManager {
    pub fn new(config: BackpressureConfig) -> Self {
        BackpressureManager {
            config,
            monitor: None,
            files_submitted: AtomicU64::new(0),
            memory_in_flight: AtomicU64::new(0),
            peak_memory: AtomicU64::new(0),
            engaged: AtomicBool::new(false),
            backoff_events: AtomicU64::new(0),
        }
    }

    /// Tighten the threshold while `monitor` reports degradation.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// File-path queue and write-request queue with the configured capacities.
    pub fn create_queues(&self) -> (Queue<PathBuf>, Queue<WriteRequest>) {
        let (ftx, frx) = bounded(self.config.max_pending_files.max(1));
        let (wtx, wrx) = bounded(self.config.max_pending_writes.max(1));
        (Queue { tx: ftx, rx: frx }, Queue { tx: wtx, rx: wrx })
    }

    fn threshold(&self) -> u64 {
        let degraded = self.monitor.as_ref().is_some_and(|m| m.is_degraded());
        if degraded {
            self.config.max_memory_usage / 2
        } else {
            self.config.max_memory_usage
        }
    }

    /// Add rendered bytes to the in-flight estimate.
    pub fn reserve(&self, bytes: u64) {
        let now = self.memory_in_flight.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak_memory.fetch_max(now, Ordering::AcqRel);
    }

    /// Remove bytes from the estimate, saturating at zero.
    pub fn release(&self, bytes: u64) {
        let _ = self
            .memory_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    pub fn current_memory_usage(&self) -> u64 {
        self.memory_in_flight.load(Ordering::Acquire)
    }

    /// Count one submitted file; every `memory_check_interval` files compare the estimate with
    /// the threshold. Between checks the previous decision stands.
    pub fn should_apply_backpressure(&self, ctx: &ProcessingContext) -> bool {
        if !self.config.enabled || ctx.is_done() {
            return false;
        }
        let n = self.files_submitted.fetch_add(1, Ordering::AcqRel) + 1;
        let interval = self.config.memory_check_interval.max(1) as u64;
        if n % interval != 0 {
            return self.engaged.load(Ordering::Acquire);
        }
        self.evaluate()
    }

    fn evaluate(&self) -> bool {
        let usage = self.current_memory_usage();
        let threshold = self.threshold();
        let engage = usage > threshold;
        let was = self.engaged.swap(engage, Ordering::AcqRel);
        if engage && !was {
            debug!(
                "Backpressure engaged: ~{} bytes in flight (threshold {})",
                usage, threshold
            );
        } else if !engage && was {
            debug!("Backpressure released: ~{} bytes in flight", usage);
        }
        engage
    }

    /// Hold the producer back with exponential backoff until the estimate drops to the
    /// threshold, `max_wait` elapses, or the scope ends.
    pub fn apply_backpressure(&self, ctx: &ProcessingContext) -> Result<(), CancelReason> {
        if !self.config.enabled {
            return Ok(());
        }
        self.backoff_events.fetch_add(1, Ordering::AcqRel);
        let started = Instant::now();
        let mut wait = BackpressureConfig::BACKOFF_START;
        while started.elapsed() < self.config.max_wait {
            ctx.sleep(wait)?;
            if !self.evaluate() {
                return Ok(());
            }
            wait = (wait * 2).min(BackpressureConfig::BACKOFF_MAX);
        }
        debug!(
            "Backpressure wait capped at {:?}; continuing",
            self.config.max_wait
        );
        Ok(())
    }

    /// One short pause when `queue` is at or above the high-water mark of its capacity, giving
    /// consumers a head start before the producer's blocking send.
    pub fn wait_for_queue_space<T>(
        &self,
        ctx: &ProcessingContext,
        queue: &Sender<T>,
    ) -> Result<(), CancelReason> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(cap) = queue.capacity() else {
            return Ok(());
        };
        let high_water = (cap as f64 * self.config.queue_high_water).ceil() as usize;
        if queue.len() >= high_water.max(1) {
            ctx.sleep(BackpressureConfig::BACKOFF_START)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            enabled: self.config.enabled,
            files_processed: self.files_submitted.load(Ordering::Acquire),
            current_memory_usage: self.current_memory_usage(),
            max_memory_usage: self.config.max_memory_usage,
            peak_memory_usage: self.peak_memory.load(Ordering::Acquire),
            backoff_events: self.backoff_events.load(Ordering::Acquire),
        }
    }
}
