//! Worker pool: N threads pulling paths from the file queue, reading and formatting each file,
//! and emitting one write request per file.

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::tools::display_path;
use crate::error::{PipelineError, PipelineResult};
use crate::format::{BINARY_SNIFF_LEN, Formatter, check_text, language_for};
use crate::metrics::MetricsSink;
use crate::pipeline::backpressure::BackpressureManager;
use crate::pipeline::context::{CancelReason, ProcessingContext};
use crate::resource::ResourceMonitor;
use crate::types::{FileOutcome, WriteRequest};
use crate::utils::config::Config;

/// Shared state every worker thread gets a clone of.
#[derive(Clone)]
pub struct WorkerPool {
    monitor: Arc<ResourceMonitor>,
    backpressure: Arc<BackpressureManager>,
    metrics: Arc<dyn MetricsSink>,
    formatter: Arc<dyn Formatter>,
    root: PathBuf,
    stream_threshold: u64,
}

/// Handles of a started pool. [`wait`](WorkerGroup::wait) is the join barrier.
pub struct WorkerGroup {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join every worker. All are joined even if one panicked.
    pub fn wait(self) -> PipelineResult<()> {
        let mut panicked = false;
        for h in self.handles {
            panicked |= h.join().is_err();
        }
        if panicked {
            return Err(PipelineError::Panicked("worker"));
        }
        Ok(())
    }
}

/// Decrements the concurrency gauge when a file leaves the processing state.
struct Active<'a>(&'a dyn MetricsSink);

impl<'a> Active<'a> {
    fn enter(sink: &'a dyn MetricsSink) -> Self {
        sink.increment_concurrency();
        Active(sink)
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.decrement_concurrency();
    }
}

struct Emitted {
    size: u64,
    streamed: bool,
}

impl WorkerPool {
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        backpressure: Arc<BackpressureManager>,
        metrics: Arc<dyn MetricsSink>,
        formatter: Arc<dyn Formatter>,
        root: &Path,
        stream_threshold: u64,
    ) -> Self {
        WorkerPool {
            monitor,
            backpressure,
            metrics,
            formatter,
            root: root.to_path_buf(),
            stream_threshold,
        }
    }

    /// Spawn `n` workers (at least one). Takes `write_tx` by value so that once every worker
    /// exits, the writer sees its queue close.
    pub fn start(
        &self,
        ctx: &ProcessingContext,
        n: usize,
        file_rx: Receiver<PathBuf>,
        write_tx: Sender<WriteRequest>,
    ) -> WorkerGroup {
        let handles = (0..n.max(1))
            .map(|_| {
                let pool = self.clone();
                let ctx = ctx.clone();
                let file_rx = file_rx.clone();
                let write_tx = write_tx.clone();
                thread::spawn(move || {
                    let _guard = ctx.cancel_on_panic();
                    pool.worker_loop(ctx, file_rx, write_tx)
                })
            })
            .collect();
        WorkerGroup { handles }
    }

    fn worker_loop(
        &self,
        ctx: ProcessingContext,
        file_rx: Receiver<PathBuf>,
        write_tx: Sender<WriteRequest>,
    ) {
        loop {
            let path = match ctx.recv(&file_rx) {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(reason) => {
                    debug!("worker stopping: {}", reason);
                    break;
                }
            };
            let rel = display_path(&path, &self.root);
            if self.monitor.is_emergency_stop_active() {
                self.metrics
                    .record_file_processed(FileOutcome::skipped(rel, "emergency stop"));
                continue;
            }
            let started = Instant::now();
            let result = self.process_file(&ctx, &path, &rel, &write_tx);
            let writer_gone = matches!(result, Err(PipelineError::Write(_)));
            self.metrics
                .record_file_processed(self.outcome(rel, result, started.elapsed()));
            if writer_gone {
                break;
            }
        }
    }

    fn outcome(
        &self,
        rel: String,
        result: PipelineResult<Emitted>,
        elapsed: Duration,
    ) -> FileOutcome {
        match result {
            Ok(Emitted { size, streamed }) => {
                trace!("{} ({} bytes{})", rel, size, if streamed { ", streamed" } else { "" });
                let language = language_for(&rel).to_string();
                FileOutcome::processed(rel, size, language, elapsed)
            }
            Err(e) => match e.skip_reason() {
                Some(reason) => {
                    debug!("skipped {}: {}", rel, e);
                    FileOutcome::skipped(rel, reason)
                }
                None => {
                    debug!("failed {}: {}", rel, e);
                    FileOutcome::failed(rel, e.kind(), e.to_string(), elapsed)
                }
            },
        }
    }

    /// Map the end of a per-file scope to an error: an ended run scope wins, otherwise the
    /// file's own deadline passed.
    fn scope_error(run: &ProcessingContext, rel: &str, reason: CancelReason) -> PipelineError {
        match run.err() {
            Some(r) => r.into(),
            None if reason == CancelReason::DeadlineExceeded => PipelineError::FileTimeout {
                path: rel.to_string(),
            },
            None => PipelineError::Canceled,
        }
    }

    fn process_file(
        &self,
        run: &ProcessingContext,
        path: &Path,
        rel: &str,
        write_tx: &Sender<WriteRequest>,
    ) -> PipelineResult<Emitted> {
        let (file_ctx, _file_scope) = self.monitor.create_file_context(run);
        let scoped = |r: CancelReason| Self::scope_error(run, rel, r);
        let read_err = |source: io::Error| PipelineError::Read {
            path: rel.to_string(),
            source,
        };

        self.monitor.wait_for_rate_limit(&file_ctx).map_err(scoped)?;
        let slot = self.monitor.acquire_read_slot(&file_ctx).map_err(scoped)?;
        let _active = Active::enter(self.metrics.as_ref());

        let mut file = File::open(path).map_err(read_err)?;
        let size = file.metadata().map_err(read_err)?.len();
        let admitted = self.monitor.validate_file(size)?;

        let request = if size > 0 && size >= self.stream_threshold {
            let mut head = Vec::with_capacity(BINARY_SNIFF_LEN);
            (&mut file)
                .take(BINARY_SNIFF_LEN as u64)
                .read_to_end(&mut head)
                .map_err(read_err)?;
            check_text(rel, &head)?;
            file.seek(SeekFrom::Start(0)).map_err(read_err)?;
            WriteRequest::stream(rel.to_string(), file, size)
        } else {
            let content = read_chunked(&file_ctx, &mut file, size).map_err(|e| match e {
                ReadStop::Scope(r) => scoped(r),
                ReadStop::Io(source) => read_err(source),
            })?;
            let rendered = self.formatter.render(rel, &content)?;
            if let Some(r) = file_ctx.err() {
                return Err(scoped(r));
            }
            WriteRequest::materialized(rel.to_string(), rendered)
        };
        drop(slot);

        let streamed = request.is_stream();
        let reserved = request.estimated_size();
        self.backpressure.reserve(reserved);
        match file_ctx.send(write_tx, request) {
            Ok(true) => {}
            Ok(false) => {
                self.backpressure.release(reserved);
                return Err(PipelineError::Write(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "writer stopped",
                )));
            }
            Err(r) => {
                self.backpressure.release(reserved);
                return Err(scoped(r));
            }
        }
        admitted.commit();
        Ok(Emitted { size, streamed })
    }
}

enum ReadStop {
    Scope(CancelReason),
    Io(io::Error),
}

/// Read the whole file in fixed-size chunks, checking the scope between chunks.
fn read_chunked(
    ctx: &ProcessingContext,
    file: &mut File,
    size_hint: u64,
) -> Result<Vec<u8>, ReadStop> {
    let mut content = Vec::with_capacity(size_hint as usize);
    let mut buf = vec![0u8; Config::READ_CHUNK_SIZE];
    loop {
        if let Some(r) = ctx.err() {
            return Err(ReadStop::Scope(r));
        }
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => content.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadStop::Io(e)),
        }
    }
    Ok(content)
}
