//! Resource monitor: the authority every stage consults for ceilings, timeouts and the
//! emergency-stop flag. All shared counters are atomics; the only locks guard in-memory
//! bookkeeping (violation list, ticker and watchdog handles) and are never held across I/O.

use crossbeam_channel::{Receiver, Sender, after, bounded, select, tick};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::context::{CancelHandle, CancelReason, ProcessingContext, Scope};
use crate::utils::config::{ResourceLimits, serialize_secs};

use super::memory::{MemorySampler, ProcessMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    FileCount,
    TotalSize,
    SoftMemory,
    HardMemory,
}

/// A ceiling breach, recorded once per kind.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
    #[serde(serialize_with = "serialize_secs")]
    pub at: Duration,
}

/// Result of one memory check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    /// Sampling disabled or unavailable.
    Unmonitored,
    Normal,
    /// Above the soft ceiling, graceful degradation off: recorded only.
    SoftLimit,
    /// Above the soft ceiling: degradation active.
    Degraded,
    /// Above the hard ceiling: emergency stop active.
    EmergencyStop,
}

/// Point-in-time snapshot of the monitor's counters.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceMetrics {
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub concurrent_reads: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub average_file_size: u64,
    /// Files per second since the monitor was created.
    pub processing_rate: f64,
    pub memory_usage_bytes: u64,
    pub peak_memory_bytes: u64,
    pub violations: Vec<String>,
    pub degradation_active: bool,
    pub emergency_stop_active: bool,
}

/// Sum of collected files checked at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub files: usize,
    pub total_size: u64,
}

struct Watchdog {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ResourceMonitor {
    limits: ResourceLimits,
    started: Instant,
    files_processed: AtomicU64,
    bytes_processed: AtomicU64,
    /// Admitted by `validate_file` but not yet committed or released.
    reserved_files: AtomicU64,
    reserved_bytes: AtomicU64,
    concurrent_reads: AtomicUsize,
    degraded: AtomicBool,
    emergency_stop: AtomicBool,
    last_memory: AtomicU64,
    peak_memory: AtomicU64,
    violations: Mutex<Vec<Violation>>,
    sampler: Box<dyn MemorySampler>,
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    rate_ticker: Mutex<Option<Receiver<Instant>>>,
    watchdog: Mutex<Option<Watchdog>>,
    closed: AtomicBool,
}

/// One admitted file's share of the count and size ceilings. Dropping it gives the share back.
pub struct FileReservation<'a> {
    monitor: &'a ResourceMonitor,
    size: u64,
    reserved: bool,
}

impl FileReservation<'_> {
    /// The file reached the writer: count it as processed.
    pub fn commit(mut self) {
        // Processed goes up before the reservation comes down; checks may briefly see both.
        self.monitor.record_file_processed(self.size);
        self.release();
    }

    fn release(&mut self) {
        if self.reserved {
            self.reserved = false;
            self.monitor.reserved_files.fetch_sub(1, Ordering::AcqRel);
            self.monitor
                .reserved_bytes
                .fetch_sub(self.size, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for FileReservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReservation")
            .field("size", &self.size)
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}

impl Drop for FileReservation<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Held while a worker reads a file; releases the read slot on drop.
pub struct ReadSlot<'a> {
    monitor: &'a ResourceMonitor,
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        let _ = self.monitor.slot_rx.try_recv();
        self.monitor.concurrent_reads.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ResourceMonitor {
    /// Monitor sampling this process's memory.
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_sampler(limits, Box::new(ProcessMemory::new()))
    }

    pub fn with_sampler(limits: ResourceLimits, sampler: Box<dyn MemorySampler>) -> Self {
        let (slot_tx, slot_rx) = bounded(limits.max_concurrent_reads.max(1));
        let rate_ticker = (limits.rate_limit_files_per_sec > 0)
            .then(|| tick(Duration::from_secs_f64(1.0 / limits.rate_limit_files_per_sec as f64)));
        ResourceMonitor {
            limits,
            started: Instant::now(),
            files_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            reserved_files: AtomicU64::new(0),
            reserved_bytes: AtomicU64::new(0),
            concurrent_reads: AtomicUsize::new(0),
            degraded: AtomicBool::new(false),
            emergency_stop: AtomicBool::new(false),
            last_memory: AtomicU64::new(0),
            peak_memory: AtomicU64::new(0),
            violations: Mutex::new(Vec::new()),
            sampler,
            slot_tx,
            slot_rx,
            rate_ticker: Mutex::new(rate_ticker),
            watchdog: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    // ---- Scopes ----

    /// Run-wide scope. A zero overall timeout means no deadline.
    pub fn create_overall_context(
        &self,
        parent: &ProcessingContext,
    ) -> (ProcessingContext, CancelHandle) {
        let timeout = &self.limits.overall_timeout;
        parent.child(Scope::Overall, (!timeout.is_zero()).then_some(*timeout))
    }

    /// Per-file scope; its expiry fails only that file.
    pub fn create_file_context(
        &self,
        parent: &ProcessingContext,
    ) -> (ProcessingContext, CancelHandle) {
        parent.child(Scope::File, Some(self.limits.file_processing_timeout))
    }

    // ---- Background sampling ----

    /// Start the watchdog that runs [`check_memory`](Self::check_memory) every `monitor_interval`.
    /// No-op when memory sampling is disabled, already started, or the monitor is closed.
    pub fn start(self: &Arc<Self>) {
        if self.limits.hard_memory_limit_mb == 0 || self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.watchdog.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.limits.monitor_interval.max(Duration::from_millis(10));
        let spawned = thread::Builder::new()
            .name(format!("{}-monitor", env!("CARGO_PKG_NAME")))
            .spawn(move || watchdog_loop(weak, stop_rx, interval));
        match spawned {
            Ok(handle) => *slot = Some(Watchdog { stop_tx, handle }),
            Err(e) => warn!("resource watchdog not started: {}", e),
        }
    }

    // ---- Admission and per-file checks ----

    /// Check the whole collected set against the file-count and total-size ceilings.
    /// Runs before any file enters the pipeline. Unreadable paths count as zero bytes.
    pub fn check_admission(&self, files: &[PathBuf]) -> PipelineResult<Admission> {
        let total_size: u64 = files
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        let admission = Admission {
            files: files.len(),
            total_size,
        };
        if !self.limits.enabled {
            return Ok(admission);
        }
        if files.len() > self.limits.max_files {
            let err = PipelineError::TooManyFiles {
                count: files.len(),
                limit: self.limits.max_files,
            };
            self.record_violation(ViolationKind::FileCount, err.to_string());
            return Err(err);
        }
        if total_size > self.limits.max_total_size {
            let err = PipelineError::TotalSizeExceeded {
                total: total_size,
                limit: self.limits.max_total_size,
            };
            self.record_violation(ViolationKind::TotalSize, err.to_string());
            return Err(err);
        }
        Ok(admission)
    }

    /// Per-file admission during the run: refused under emergency stop or once a ceiling is
    /// reached. On success the file's count and bytes are held against the ceilings until the
    /// reservation is committed or dropped, so concurrent workers cannot overshoot them.
    pub fn validate_file(&self, size: u64) -> PipelineResult<FileReservation<'_>> {
        if self.is_emergency_stop_active() {
            return Err(PipelineError::EmergencyStop(
                "new files are not admitted".to_string(),
            ));
        }
        if !self.limits.enabled {
            return Ok(FileReservation {
                monitor: self,
                size,
                reserved: false,
            });
        }

        let max_files = self.limits.max_files as u64;
        let files = self
            .reserved_files
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                let processed = self.files_processed.load(Ordering::Acquire);
                (processed + reserved < max_files).then(|| reserved + 1)
            });
        if files.is_err() {
            let processed = self.files_processed.load(Ordering::Acquire);
            self.record_violation(
                ViolationKind::FileCount,
                format!("processed {} files, limit {}", processed, self.limits.max_files),
            );
            return Err(PipelineError::FileLimit {
                limit: self.limits.max_files,
            });
        }

        let max_bytes = self.limits.max_total_size;
        let bytes = self
            .reserved_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                let processed = self.bytes_processed.load(Ordering::Acquire);
                let total = processed.saturating_add(reserved).saturating_add(size);
                (total <= max_bytes).then(|| reserved + size)
            });
        if let Err(reserved) = bytes {
            self.reserved_files.fetch_sub(1, Ordering::AcqRel);
            let processed = self.bytes_processed.load(Ordering::Acquire);
            self.record_violation(
                ViolationKind::TotalSize,
                format!(
                    "processed {} bytes + {} in flight + {} exceeds limit {}",
                    processed, reserved, size, max_bytes
                ),
            );
            return Err(PipelineError::SizeLimit { limit: max_bytes });
        }

        Ok(FileReservation {
            monitor: self,
            size,
            reserved: true,
        })
    }

    /// Block until the shared rate limiter allows one more file, or the scope ends.
    pub fn wait_for_rate_limit(&self, ctx: &ProcessingContext) -> Result<(), CancelReason> {
        let ticker = self.rate_ticker.lock().unwrap().clone();
        match ticker {
            Some(ticker) => ctx.recv(&ticker).map(|_| ()),
            None => ctx.err().map_or(Ok(()), Err),
        }
    }

    /// Take one of `max_concurrent_reads` slots, or give up when the scope ends.
    pub fn acquire_read_slot(&self, ctx: &ProcessingContext) -> Result<ReadSlot<'_>, CancelReason> {
        // The slot channel is never disconnected while `self` is alive.
        ctx.send(&self.slot_tx, ())?;
        self.concurrent_reads.fetch_add(1, Ordering::AcqRel);
        Ok(ReadSlot { monitor: self })
    }

    pub fn record_file_processed(&self, bytes: u64) {
        self.files_processed.fetch_add(1, Ordering::AcqRel);
        self.bytes_processed.fetch_add(bytes, Ordering::AcqRel);
    }

    // ---- Memory ceilings ----

    /// Sample memory and compare with the ceilings. Soft breach → degradation (when enabled);
    /// hard breach → emergency stop.
    pub fn check_memory(&self) -> MemoryStatus {
        if self.limits.hard_memory_limit_mb == 0 {
            return MemoryStatus::Unmonitored;
        }
        let Some(used) = self.sampler.sample_bytes() else {
            return MemoryStatus::Unmonitored;
        };
        self.last_memory.store(used, Ordering::Release);
        self.peak_memory.fetch_max(used, Ordering::AcqRel);

        let hard = self.limits.hard_memory_limit_bytes();
        let soft = self.limits.soft_memory_limit_bytes();
        if used > hard {
            let msg = format!("memory {} MB above hard limit {} MB", used >> 20, hard >> 20);
            self.record_violation(ViolationKind::HardMemory, msg.clone());
            self.trigger_emergency_stop(&msg);
            MemoryStatus::EmergencyStop
        } else if used > soft {
            self.record_violation(
                ViolationKind::SoftMemory,
                format!("memory {} MB above soft limit {} MB", used >> 20, soft >> 20),
            );
            if self.limits.graceful_degradation {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!("Entering degraded mode: backpressure tightened");
                }
                MemoryStatus::Degraded
            } else {
                MemoryStatus::SoftLimit
            }
        } else {
            if self.degraded.swap(false, Ordering::AcqRel) {
                info!("Memory back under soft limit; leaving degraded mode");
            }
            MemoryStatus::Normal
        }
    }

    /// Set the emergency-stop flag. Never cleared for the life of the monitor.
    pub fn trigger_emergency_stop(&self, reason: &str) {
        if !self.emergency_stop.swap(true, Ordering::AcqRel) {
            warn!("Emergency stop: {}", reason);
        }
    }

    pub fn is_emergency_stop_active(&self) -> bool {
        self.emergency_stop.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn record_violation(&self, kind: ViolationKind, message: String) {
        let mut violations = self.violations.lock().unwrap();
        if violations.iter().any(|v| v.kind == kind) {
            return;
        }
        warn!("Resource limit: {}", message);
        violations.push(Violation {
            kind,
            message,
            at: self.started.elapsed(),
        });
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().unwrap().clone()
    }

    // ---- Reporting ----

    pub fn metrics(&self) -> ResourceMetrics {
        let files = self.files_processed.load(Ordering::Acquire);
        let bytes = self.bytes_processed.load(Ordering::Acquire);
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        ResourceMetrics {
            files_processed: files,
            bytes_processed: bytes,
            concurrent_reads: self.concurrent_reads.load(Ordering::Acquire),
            elapsed,
            average_file_size: bytes.checked_div(files).unwrap_or(0),
            processing_rate: if secs > 0.0 { files as f64 / secs } else { 0.0 },
            memory_usage_bytes: self.last_memory.load(Ordering::Acquire),
            peak_memory_bytes: self.peak_memory.load(Ordering::Acquire),
            violations: self
                .violations
                .lock()
                .unwrap()
                .iter()
                .map(|v| v.message.clone())
                .collect(),
            degradation_active: self.is_degraded(),
            emergency_stop_active: self.is_emergency_stop_active(),
        }
    }

    pub fn log_resource_info(&self) {
        let l = &self.limits;
        if !l.enabled {
            debug!("Resource limits disabled");
            return;
        }
        debug!(
            "Resource limits: max_files={} max_total_size={}B file_timeout={:?} overall_timeout={:?} max_reads={} rate={}/s hard_memory={}MB degradation={}",
            l.max_files,
            l.max_total_size,
            l.file_processing_timeout,
            l.overall_timeout,
            l.max_concurrent_reads,
            l.rate_limit_files_per_sec,
            l.hard_memory_limit_mb,
            l.graceful_degradation
        );
    }

    /// Stop the watchdog and rate ticker. Safe to call repeatedly, or without [`start`](Self::start).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rate_ticker.lock().unwrap().take();
        let watchdog = self.watchdog.lock().unwrap().take();
        if let Some(Watchdog { stop_tx, handle }) = watchdog {
            drop(stop_tx);
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("resource watchdog panicked");
            }
        }
        debug!("Resource monitor closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        // Signal only: the last Arc may be released on the watchdog thread itself.
        if let Ok(mut slot) = self.watchdog.lock()
            && let Some(w) = slot.take()
        {
            drop(w.stop_tx);
        }
    }
}

fn watchdog_loop(monitor: Weak<ResourceMonitor>, stop_rx: Receiver<()>, interval: Duration) {
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(after(interval)) -> _ => {
                let Some(m) = monitor.upgrade() else { break };
                if m.check_memory() == MemoryStatus::EmergencyStop {
                    break;
                }
            }
        }
    }
}
