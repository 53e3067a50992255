//! Error types for the aggregation pipeline.
//!
//! Every error carries a machine-readable [`ErrorKind`] (see [`PipelineError::kind`]) next to
//! its human message. Per-file kinds end up in metrics as failed/skipped outcomes; only the
//! fatal kinds are returned from a run.

use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::context::CancelReason;

/// Result alias for pipeline internals.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Resource limits refused the collected file set before processing started.
    Admission,
    /// Collector could not enumerate the source tree.
    Collect,
    /// Invalid configuration value.
    Config,
    /// Reading a source file failed.
    Read,
    /// Formatter refused or failed on a file's content.
    Format,
    /// A single file exceeded its processing timeout.
    FileTimeout,
    /// Per-file refusal because a file-count or total-size ceiling was reached mid-run.
    Limit,
    /// Emergency stop refused the file.
    EmergencyStop,
    /// Writing the output document failed.
    Write,
    /// The overall run timeout expired.
    DeadlineExceeded,
    /// The run was cancelled by the caller.
    Canceled,
    /// A pipeline thread panicked.
    Panicked,
}

impl ErrorKind {
    /// Stable code for logs and reports.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Admission => "admission",
            ErrorKind::Collect => "collect",
            ErrorKind::Config => "config",
            ErrorKind::Read => "read",
            ErrorKind::Format => "format",
            ErrorKind::FileTimeout => "file_timeout",
            ErrorKind::Limit => "limit",
            ErrorKind::EmergencyStop => "emergency_stop",
            ErrorKind::Write => "write",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Panicked => "panicked",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("file count {count} exceeds limit of {limit}")]
    TooManyFiles { count: usize, limit: usize },

    #[error("total size {total} bytes exceeds limit of {limit} bytes")]
    TotalSizeExceeded { total: u64, limit: u64 },

    #[error("collect {root}: {message}")]
    Collect { root: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("format {path}: {message}")]
    Format { path: String, message: String },

    #[error("{path}: processing timeout")]
    FileTimeout { path: String },

    #[error("file limit of {limit} files reached")]
    FileLimit { limit: usize },

    #[error("size limit of {limit} bytes reached")]
    SizeLimit { limit: u64 },

    #[error("emergency stop active: {0}")]
    EmergencyStop(String),

    #[error("write output: {0}")]
    Write(#[source] std::io::Error),

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context canceled")]
    Canceled,

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::TooManyFiles { .. } | PipelineError::TotalSizeExceeded { .. } => {
                ErrorKind::Admission
            }
            PipelineError::Collect { .. } => ErrorKind::Collect,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Read { .. } => ErrorKind::Read,
            PipelineError::Format { .. } => ErrorKind::Format,
            PipelineError::FileTimeout { .. } => ErrorKind::FileTimeout,
            PipelineError::FileLimit { .. } | PipelineError::SizeLimit { .. } => ErrorKind::Limit,
            PipelineError::EmergencyStop(_) => ErrorKind::EmergencyStop,
            PipelineError::Write(_) => ErrorKind::Write,
            PipelineError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            PipelineError::Canceled => ErrorKind::Canceled,
            PipelineError::Panicked(_) => ErrorKind::Panicked,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// True for errors that end the whole run rather than a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Write
                | ErrorKind::DeadlineExceeded
                | ErrorKind::Canceled
                | ErrorKind::Panicked
                | ErrorKind::Admission
                | ErrorKind::Collect
                | ErrorKind::Config
        )
    }

    /// Skip reason recorded in metrics for refusals that are not failures.
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            PipelineError::EmergencyStop(_) => Some("emergency stop"),
            PipelineError::FileLimit { .. } => Some("file limit"),
            PipelineError::SizeLimit { .. } => Some("size limit"),
            PipelineError::Canceled => Some("context canceled"),
            PipelineError::DeadlineExceeded | PipelineError::FileTimeout { .. } => Some("timeout"),
            _ => None,
        }
    }
}

impl From<CancelReason> for PipelineError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Canceled => PipelineError::Canceled,
            CancelReason::DeadlineExceeded => PipelineError::DeadlineExceeded,
        }
    }
}
