//! Pipeline components: cancellation scopes, backpressure, workers, writer and the coordinator.

pub mod backpressure;
pub mod context;
pub mod orchestrator;
pub mod worker;
pub mod writer;

pub use backpressure::{BackpressureManager, BackpressureStats};
pub use context::{CancelHandle, CancelReason, ProcessingContext, Scope};
pub use orchestrator::{Aggregator, RunSummary};
pub use worker::{WorkerGroup, WorkerPool};
pub use writer::{WriterHandle, WriterSummary, run_writer, spawn_writer};
