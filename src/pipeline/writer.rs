//! The writer: sole owner of the output stream for a run.
//!
//! The stream is moved into the writer thread, so no other stage can touch it. Requests are
//! written in arrival order. The first write error is fatal: the writer cancels the run scope,
//! then keeps draining its queue (releasing reservations) so no worker blocks on a dead writer.

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, error};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{PipelineError, PipelineResult};
use crate::format::{Envelope, Formatter};
use crate::pipeline::backpressure::BackpressureManager;
use crate::pipeline::context::ProcessingContext;
use crate::types::{WriteContent, WriteRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterSummary {
    pub entries_written: usize,
    pub bytes_written: u64,
}

/// Write adapter counting the bytes that reach the stream.
struct CountingWriter<W> {
    inner: W,
    bytes: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn write_entry<W: Write>(
    out: &mut CountingWriter<W>,
    formatter: &dyn Formatter,
    envelope: &Envelope,
    index: usize,
    request: WriteRequest,
) -> io::Result<()> {
    formatter.delimiter(&mut *out, index, &request.path, envelope)?;
    match request.content {
        WriteContent::Materialized(rendered) => out.write_all(rendered.as_bytes()),
        WriteContent::Stream { mut file, size } => {
            let copied = formatter.render_stream(&request.path, &mut file, &mut *out)?;
            if copied != size {
                debug!(
                    "{} changed while streaming: {} bytes expected, {} copied",
                    request.path, size, copied
                );
            }
            Ok(())
        }
    }
}

/// Consume `rx` until every sender is gone, writing the document to `out`. Sends the outcome
/// on `done_tx` and hands the stream back.
pub fn run_writer<W: Write>(
    out: W,
    rx: Receiver<WriteRequest>,
    done_tx: Sender<PipelineResult<WriterSummary>>,
    ctx: &ProcessingContext,
    formatter: &dyn Formatter,
    envelope: &Envelope,
    backpressure: &BackpressureManager,
) -> W {
    let mut out = CountingWriter {
        inner: out,
        bytes: 0,
    };
    let mut entries = 0usize;
    let mut failure: Option<io::Error> = formatter.open(&mut out, envelope).err();
    if failure.is_some() {
        ctx.cancel();
    }

    for request in rx.iter() {
        let reserved = request.estimated_size();
        if failure.is_none() {
            match write_entry(&mut out, formatter, envelope, entries, request) {
                Ok(()) => entries += 1,
                Err(e) => {
                    error!("write failed, cancelling run: {}", e);
                    failure = Some(e);
                    ctx.cancel();
                }
            }
        }
        backpressure.release(reserved);
    }

    if failure.is_none()
        && let Err(e) = formatter
            .close(&mut out, entries, envelope)
            .and_then(|_| out.flush())
    {
        failure = Some(e);
    }

    let result = match failure {
        Some(e) => Err(PipelineError::Write(e)),
        None => {
            debug!("writer done: {} entries, {} bytes", entries, out.bytes);
            Ok(WriterSummary {
                entries_written: entries,
                bytes_written: out.bytes,
            })
        }
    };
    let _ = done_tx.send(result);
    out.inner
}

/// Writer running on its own thread.
pub struct WriterHandle<W> {
    done_rx: Receiver<PipelineResult<WriterSummary>>,
    handle: JoinHandle<W>,
}

impl<W> WriterHandle<W> {
    /// Wait for the writer's outcome and take the stream back.
    pub fn finish(self) -> (PipelineResult<WriterSummary>, Option<W>) {
        let result = self
            .done_rx
            .recv()
            .unwrap_or(Err(PipelineError::Panicked("writer")));
        match self.handle.join() {
            Ok(out) => (result, Some(out)),
            Err(_) => (Err(PipelineError::Panicked("writer")), None),
        }
    }
}

/// Move `out` into a new writer thread.
pub fn spawn_writer<W: Write + Send + 'static>(
    out: W,
    rx: Receiver<WriteRequest>,
    ctx: ProcessingContext,
    formatter: Arc<dyn Formatter>,
    envelope: Envelope,
    backpressure: Arc<BackpressureManager>,
) -> WriterHandle<W> {
    let (done_tx, done_rx) = bounded(1);
    let handle = thread::spawn(move || {
        let _guard = ctx.cancel_on_panic();
        run_writer(
            out,
            rx,
            done_tx,
            &ctx,
            formatter.as_ref(),
            &envelope,
            &backpressure,
        )
    });
    WriterHandle { done_rx, handle }
}
