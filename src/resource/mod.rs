//! Resource governance: ceilings, timeouts and run-wide counters.

pub mod memory;
pub mod monitor;

pub use memory::{FixedMemory, MemorySampler, ProcessMemory};
pub use monitor::{
    Admission, FileReservation, MemoryStatus, ReadSlot, ResourceMetrics, ResourceMonitor, Violation, ViolationKind,
};
