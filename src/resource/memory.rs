//! Process memory sampling for the resource monitor's soft and hard ceilings.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of the current memory figure compared against the configured ceilings.
pub trait MemorySampler: Send + Sync {
    /// Resident memory in bytes, or `None` when it cannot be measured.
    fn sample_bytes(&self) -> Option<u64>;
}

/// Resident set size of this process, via sysinfo.
pub struct ProcessMemory {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| log::debug!("memory sampling unavailable: {}", e))
            .ok();
        ProcessMemory {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemory {
    fn sample_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory())
    }
}

/// Fixed, settable reading. Lets callers drive the ceilings without real allocation.
#[derive(Debug, Default)]
pub struct FixedMemory {
    bytes: AtomicU64,
}

impl FixedMemory {
    pub fn new(bytes: u64) -> Self {
        FixedMemory {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }
}

impl MemorySampler for FixedMemory {
    fn sample_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::Relaxed))
    }
}

impl<T: MemorySampler + ?Sized> MemorySampler for std::sync::Arc<T> {
    fn sample_bytes(&self) -> Option<u64> {
        (**self).sample_bytes()
    }
}
