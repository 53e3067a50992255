//! CLI command handler: config file, flag overrides, Ctrl+C cancellation, report.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;

use crate::engine::arg_parser::Cli;
use crate::engine::tools::canonicalize_root;
use crate::pipeline::{Aggregator, ProcessingContext, RunSummary};
use crate::utils::config::Config;
use crate::utils::{apply_file_to_config, load_bundle_toml, setup_logging};

fn secs(v: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(v).with_context(|| format!("invalid --{flag} {v}"))
}

/// Defaults, then `.srcbundle.toml` from the source directory, then flags.
pub fn build_config(cli: &Cli, root: &Path) -> Result<Config> {
    let mut config = Config::default();
    if let Some(file) = load_bundle_toml(root) {
        debug!("Applying config file from {}", root.display());
        apply_file_to_config(&file, &mut config);
    }

    if let Some(format) = cli.format {
        config.format = format;
    }
    if let Some(prefix) = &cli.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(suffix) = &cli.suffix {
        config.suffix = suffix.clone();
    }
    if cli.concurrency.is_some() {
        config.concurrency = cli.concurrency;
    }

    let limits = &mut config.resources;
    if let Some(v) = cli.max_files {
        limits.max_files = v;
    }
    if let Some(v) = cli.max_total_size {
        limits.max_total_size = v;
    }
    if let Some(v) = cli.file_timeout {
        limits.file_processing_timeout = secs(v, "file-timeout")?;
    }
    if let Some(v) = cli.timeout {
        limits.overall_timeout = secs(v, "timeout")?;
    }
    if let Some(v) = cli.max_reads {
        limits.max_concurrent_reads = v;
    }
    if let Some(v) = cli.rate_limit {
        limits.rate_limit_files_per_sec = v;
    }
    if let Some(v) = cli.memory_limit {
        limits.hard_memory_limit_mb = v;
    }
    if cli.no_limits == Some(true) {
        limits.enabled = false;
    }
    if cli.no_backpressure == Some(true) {
        config.backpressure.enabled = false;
    }

    let collector = &mut config.collector;
    collector.exclude.extend(cli.exclude.iter().cloned());
    collector.ignore_dirs.extend(cli.ignore_dir.iter().cloned());
    if let Some(v) = cli.hidden {
        collector.include_hidden = v;
    }
    if let Some(v) = cli.follow_links {
        collector.follow_links = v;
    }
    if cli.no_gitignore == Some(true) {
        collector.respect_gitignore = false;
    }

    config.validate()?;
    Ok(config)
}

fn write_report(summary: &RunSummary, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("serialize report")?;
    std::fs::write(path, json).with_context(|| format!("write report {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

/// Aggregate `cli.dir` into the output file. Ctrl+C cancels the run; the partial document is
/// still closed, and the run reports the cancellation as an error.
pub fn handle_run(cli: &Cli) -> Result<()> {
    setup_logging(cli.is_verbose());
    let root = canonicalize_root(&cli.dir)?;
    let config = build_config(cli, &root)?;
    let output = cli.output_path(&root, config.format);

    let (ctx, cancel) = ProcessingContext::background().with_cancel();
    ctrlc::set_handler(move || {
        warn!("Interrupted; cancelling run");
        cancel.cancel();
    })
    .context("set Ctrl+C handler")?;

    debug!("Aggregating {} -> {}", root.display(), output.display());
    let aggregator = Aggregator::new(config)?;
    let summary = aggregator.run(&ctx, &root, &output)?;

    info!(
        "Wrote {} files ({} bytes) to {}",
        summary.writer.entries_written,
        summary.writer.bytes_written,
        output.display()
    );
    if summary.emergency_stop {
        warn!("Memory ceiling reached: output is partial");
    }
    if cli.is_verbose() {
        for line in summary.report.to_string().lines() {
            debug!("{}", line);
        }
    }
    if let Some(path) = cli.report_path() {
        write_report(&summary, &path)?;
    }
    Ok(())
}
