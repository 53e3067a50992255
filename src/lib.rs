//! Srcbundle: aggregate a source tree into one JSON, YAML or Markdown document, reading files
//! in parallel under resource ceilings and backpressure.

pub mod collect;
pub mod engine;
pub mod error;
pub mod format;
pub mod metrics;
pub mod pipeline;
pub mod resource;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::*;

pub use collect::{FileCollector, WalkCollector};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use format::{Envelope, Formatter, OutputFormat};
pub use metrics::{MetricsCollector, MetricsSink, Phase, ProcessingReport};
pub use pipeline::{Aggregator, ProcessingContext, RunSummary};
pub use utils::config::Config;

use log::debug;
use std::path::Path;

/// Result alias used by public srcbundle API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Single entry point: aggregate `root` into the file at `output` with `config`.
///
/// Pipeline errors come back wrapped in [`anyhow::Error`]; recover the kind with
/// `err.downcast_ref::<PipelineError>()`. Cancel from another thread by running
/// [`Aggregator::run`] with a context from [`ProcessingContext::with_cancel`] instead.
pub fn aggregate_dir(root: &Path, output: &Path, config: &Config) -> Result<RunSummary> {
    debug!(
        "{} CONFIG:{:#?}",
        env!("CARGO_PKG_NAME").to_string().to_uppercase(),
        config
    );
    let aggregator = Aggregator::new(config.clone())?;
    let summary = aggregator.run(&ProcessingContext::background(), root, output)?;
    Ok(summary)
}
