//! Data passed between pipeline stages.

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::fs::File;
use std::time::Duration;

use crate::error::ErrorKind;

/// Body of a [`WriteRequest`]: a rendered fragment, or an open file the writer copies in chunks.
pub enum WriteContent {
    Materialized(String),
    Stream { file: File, size: u64 },
}

/// Unit of output handed from one worker to the writer. Moved into the queue on emission.
pub struct WriteRequest {
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    pub content: WriteContent,
}

impl WriteRequest {
    pub fn materialized(path: String, rendered: String) -> Self {
        WriteRequest {
            path,
            content: WriteContent::Materialized(rendered),
        }
    }

    pub fn stream(path: String, file: File, size: u64) -> Self {
        WriteRequest {
            path,
            content: WriteContent::Stream { file, size },
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.content, WriteContent::Stream { .. })
    }

    /// Bytes counted against the backpressure memory estimate. Streams hold no content in memory.
    pub fn estimated_size(&self) -> u64 {
        match &self.content {
            WriteContent::Materialized(s) => s.len() as u64,
            WriteContent::Stream { .. } => 0,
        }
    }
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("WriteRequest");
        d.field("path", &self.path);
        match &self.content {
            WriteContent::Materialized(s) => d.field("len", &s.len()),
            WriteContent::Stream { size, .. } => d.field("stream_size", size),
        };
        d.finish()
    }
}

/// Both ends of a bounded stage queue.
pub struct Queue<T> {
    pub tx: Sender<T>,
    pub rx: Receiver<T>,
}

impl<T> Queue<T> {
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

/// What happened to one file.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Processed,
    Skipped { reason: String },
    Failed { kind: String, message: String },
}

/// Per-file record kept by the metrics collector.
#[derive(Clone, Debug, Serialize)]
pub struct FileOutcome {
    pub path: String,
    pub size: u64,
    pub language: String,
    #[serde(serialize_with = "crate::utils::config::serialize_secs")]
    pub elapsed: Duration,
    pub status: OutcomeStatus,
}

impl FileOutcome {
    pub fn processed(path: String, size: u64, language: String, elapsed: Duration) -> Self {
        FileOutcome {
            path,
            size,
            language,
            elapsed,
            status: OutcomeStatus::Processed,
        }
    }

    pub fn skipped(path: String, reason: impl Into<String>) -> Self {
        FileOutcome {
            path,
            size: 0,
            language: String::new(),
            elapsed: Duration::ZERO,
            status: OutcomeStatus::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn failed(path: String, kind: ErrorKind, message: String, elapsed: Duration) -> Self {
        FileOutcome {
            path,
            size: 0,
            language: String::new(),
            elapsed,
            status: OutcomeStatus::Failed {
                kind: kind.code().to_string(),
                message,
            },
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Processed)
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}
