//! Coordinator: collection, admission, stage start-up, the producer loop, join and finalization.
//!
//! Completion protocol: the producer drops the path sender → workers drain and exit → join
//! barrier → the last write sender is gone → the writer closes the document and signals done.

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::collect::{FileCollector, WalkCollector};
use crate::engine::tools::{canonicalize_output, display_path};
use crate::error::{PipelineError, PipelineResult};
use crate::format::{Envelope, Formatter};
use crate::metrics::{MetricsCollector, MetricsSink, Phase, ProcessingReport};
use crate::pipeline::backpressure::{BackpressureManager, BackpressureStats};
use crate::pipeline::context::{CancelReason, ProcessingContext};
use crate::pipeline::worker::WorkerPool;
use crate::pipeline::writer::{WriterSummary, spawn_writer};
use crate::resource::{ResourceMetrics, ResourceMonitor};
use crate::types::FileOutcome;
use crate::utils::config::Config;
use crate::utils::fd_limit::cap_workers;

/// What a completed run produced.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub output: Option<PathBuf>,
    pub files_collected: usize,
    pub total_size: u64,
    pub writer: WriterSummary,
    /// The hard memory ceiling stopped admission of new files; the document is partial.
    pub emergency_stop: bool,
    pub report: ProcessingReport,
    pub resources: ResourceMetrics,
    pub backpressure: BackpressureStats,
}

/// Closes the monitor on every exit path.
struct MonitorGuard<'a>(&'a ResourceMonitor);

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// One aggregation run. The monitor is closed when the run ends, so build one per run.
pub struct Aggregator {
    config: Config,
    collector: Option<Box<dyn FileCollector>>,
    formatter: Arc<dyn Formatter>,
    monitor: Arc<ResourceMonitor>,
    backpressure: Arc<BackpressureManager>,
    metrics: Arc<MetricsCollector>,
}

impl Aggregator {
    pub fn new(config: Config) -> PipelineResult<Self> {
        config.validate()?;
        let monitor = Arc::new(ResourceMonitor::new(config.resources.clone()));
        let backpressure = Arc::new(
            BackpressureManager::new(config.backpressure.clone()).with_monitor(monitor.clone()),
        );
        Ok(Aggregator {
            formatter: config.format.formatter(),
            collector: None,
            monitor,
            backpressure,
            metrics: Arc::new(MetricsCollector::new()),
            config,
        })
    }

    /// Replace the default tree walker.
    pub fn with_collector(mut self, collector: impl FileCollector + 'static) -> Self {
        self.collector = Some(Box::new(collector));
        self
    }

    /// Replace the formatter chosen by `config.format`.
    pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Use an existing monitor (e.g. one with a substitute memory sampler).
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.backpressure = Arc::new(
            BackpressureManager::new(self.config.backpressure.clone()).with_monitor(monitor.clone()),
        );
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn backpressure(&self) -> &Arc<BackpressureManager> {
        &self.backpressure
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Aggregate `root` into the file at `output`. The file is created only after admission.
    pub fn run(
        &self,
        parent: &ProcessingContext,
        root: &Path,
        output: &Path,
    ) -> PipelineResult<RunSummary> {
        let output_abs = canonicalize_output(output).unwrap_or_else(|| output.to_path_buf());
        let (mut summary, _) = self.execute(parent, root, Some(&output_abs), || {
            File::create(output).map(BufWriter::new)
        })?;
        summary.output = Some(output.to_path_buf());
        Ok(summary)
    }

    /// Aggregate `root` into the stream returned by `open`, which is called only after
    /// admission. The stream is handed back with the summary.
    pub fn run_to_writer<W, F>(
        &self,
        parent: &ProcessingContext,
        root: &Path,
        open: F,
    ) -> PipelineResult<(RunSummary, W)>
    where
        W: Write + Send + 'static,
        F: FnOnce() -> io::Result<W>,
    {
        self.execute(parent, root, None, open)
    }

    fn collect(&self, root: &Path, output: Option<&Path>) -> PipelineResult<Vec<PathBuf>> {
        match &self.collector {
            Some(c) => c.collect(root),
            None => {
                let mut walker = WalkCollector::new(self.config.collector.clone());
                if let Some(o) = output {
                    walker = walker.skip_path(o.to_path_buf());
                }
                walker.collect(root)
            }
        }
    }

    fn execute<W, F>(
        &self,
        parent: &ProcessingContext,
        root: &Path,
        output: Option<&Path>,
        open: F,
    ) -> PipelineResult<(RunSummary, W)>
    where
        W: Write + Send + 'static,
        F: FnOnce() -> io::Result<W>,
    {
        let _close = MonitorGuard(&self.monitor);
        let root = root.canonicalize().map_err(|e| PipelineError::Collect {
            root: root.to_path_buf(),
            message: e.to_string(),
        })?;

        // Phase 1: collection
        let t = Instant::now();
        let files = self.collect(&root, output)?;
        self.metrics.record_phase(Phase::Collection, t.elapsed());
        info!("Collected {} files under {}", files.len(), root.display());

        // Phase 2: admission, before anything is created
        let t = Instant::now();
        self.monitor.log_resource_info();
        let admission = self.monitor.check_admission(&files)?;
        self.metrics.record_phase(Phase::Admission, t.elapsed());

        // Phase 3: processing
        let t = Instant::now();
        let out = open().map_err(PipelineError::Write)?;
        let (run_ctx, _run_scope) = self.monitor.create_overall_context(parent);
        self.monitor.start();

        let (file_q, write_q) = self.backpressure.create_queues();
        let writer = spawn_writer(
            out,
            write_q.rx,
            run_ctx.clone(),
            self.formatter.clone(),
            Envelope::new(self.config.prefix.as_str(), self.config.suffix.as_str()),
            self.backpressure.clone(),
        );
        let n = cap_workers(self.config.worker_count()).min(files.len().max(1));
        debug!("Starting {} workers", n);
        let pool = WorkerPool::new(
            self.monitor.clone(),
            self.backpressure.clone(),
            self.metrics.clone(),
            self.formatter.clone(),
            &root,
            self.config.stream_threshold,
        );
        let workers = pool.start(&run_ctx, n, file_q.rx.clone(), write_q.tx);

        let (unsent, reason) = self.produce(&run_ctx, files, file_q.tx);
        let joined = workers.wait();
        // Paths still queued when the workers stopped never reached one.
        let leftover: Vec<PathBuf> = file_q.rx.try_iter().collect();
        for path in unsent.into_iter().chain(leftover) {
            self.metrics
                .record_file_processed(FileOutcome::skipped(display_path(&path, &root), reason));
        }
        let (written, out) = writer.finish();
        self.metrics.record_phase(Phase::Processing, t.elapsed());

        // Phase 4: finalization
        let t = Instant::now();
        let emergency_stop = self.monitor.is_emergency_stop_active();
        if emergency_stop {
            warn!("Emergency stop was active; the output is partial");
        }
        let written = written?;
        joined?;
        if let Some(reason) = run_ctx.err() {
            return Err(reason.into());
        }
        let out = out.ok_or(PipelineError::Panicked("writer"))?;
        self.monitor.close();
        self.metrics.record_phase(Phase::Finalization, t.elapsed());

        let summary = RunSummary {
            output: None,
            files_collected: admission.files,
            total_size: admission.total_size,
            writer: written,
            emergency_stop,
            report: self.metrics.generate_report(),
            resources: self.monitor.metrics(),
            backpressure: self.backpressure.stats(),
        };
        Ok((summary, out))
    }

    /// Feed the file queue. Returns the paths never handed to a worker and why.
    fn produce(
        &self,
        ctx: &ProcessingContext,
        files: Vec<PathBuf>,
        tx: Sender<PathBuf>,
    ) -> (Vec<PathBuf>, &'static str) {
        let stop = |r: CancelReason| {
            PipelineError::from(r)
                .skip_reason()
                .unwrap_or("context canceled")
        };
        let mut iter = files.into_iter();
        while let Some(path) = iter.next() {
            let halted = if self.monitor.is_emergency_stop_active() {
                Some("emergency stop")
            } else if self.backpressure.should_apply_backpressure(ctx)
                && let Err(r) = self.backpressure.apply_backpressure(ctx)
            {
                Some(stop(r))
            } else if let Err(r) = self.backpressure.wait_for_queue_space(ctx, &tx) {
                Some(stop(r))
            } else {
                match ctx.send(&tx, path.clone()) {
                    Ok(true) => None,
                    Ok(false) => Some("context canceled"),
                    Err(r) => Some(stop(r)),
                }
            };
            if let Some(reason) = halted {
                debug!("producer stopped: {}", reason);
                return (std::iter::once(path).chain(iter).collect(), reason);
            }
        }
        (Vec::new(), "context canceled")
    }
}
