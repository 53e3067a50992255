//! Application configuration: the injected [`Config`] value and the defaults behind it.
//! Tuning and thresholds in one place.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::format::OutputFormat;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    config_filename: String,
    report_filename: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                config_filename: format!(".{pkg}.toml"),
                report_filename: format!("{pkg}.report.json"),
            }
        })
    }

    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }

    pub fn report_filename(&self) -> &str {
        &self.report_filename
    }

    /// Default output file name for a source directory name and format, e.g. `myproj.json`.
    pub fn output_filename(&self, dir_name: &str, format: OutputFormat) -> String {
        let stem = if dir_name.is_empty() {
            self.pkg_name
        } else {
            dir_name
        };
        format!("{stem}.{}", format.extension())
    }

    /// Names excluded from the walk by default, on top of the collector's ignore list.
    pub fn default_exclude_patterns(&self) -> Vec<String> {
        vec![
            self.config_filename().to_string(),
            self.report_filename().to_string(),
        ]
    }
}

// ---- Durations as seconds ----

pub fn serialize_secs<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64())
}

fn deserialize_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

// ---- Resource ceilings ----

/// Ceilings enforced by the resource monitor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// When false, admission and per-file limits are not enforced; timeouts still apply.
    pub enabled: bool,
    pub max_files: usize,
    pub max_total_size: u64,
    #[serde(serialize_with = "serialize_secs", deserialize_with = "deserialize_secs")]
    pub file_processing_timeout: Duration,
    /// Zero disables the overall timeout.
    #[serde(serialize_with = "serialize_secs", deserialize_with = "deserialize_secs")]
    pub overall_timeout: Duration,
    pub max_concurrent_reads: usize,
    /// Zero disables rate limiting.
    pub rate_limit_files_per_sec: u32,
    /// Zero disables memory sampling.
    pub hard_memory_limit_mb: u64,
    /// Fraction of the hard limit at which degradation starts.
    pub soft_memory_fraction: f64,
    pub graceful_degradation: bool,
    #[serde(serialize_with = "serialize_secs", deserialize_with = "deserialize_secs")]
    pub monitor_interval: Duration,
}

impl ResourceLimits {
    pub const MAX_FILES: usize = 10_000;
    pub const MAX_TOTAL_SIZE: u64 = 1024 * 1024 * 1024; // 1 GB
    pub const FILE_TIMEOUT_SECS: u64 = 30;
    pub const OVERALL_TIMEOUT_SECS: u64 = 3600;
    pub const MAX_CONCURRENT_READS: usize = 10;
    pub const HARD_MEMORY_LIMIT_MB: u64 = 512;
    pub const SOFT_MEMORY_FRACTION: f64 = 0.8;
    pub const MONITOR_INTERVAL_MS: u64 = 500;

    pub fn hard_memory_limit_bytes(&self) -> u64 {
        self.hard_memory_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn soft_memory_limit_bytes(&self) -> u64 {
        (self.hard_memory_limit_bytes() as f64 * self.soft_memory_fraction) as u64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            max_files: Self::MAX_FILES,
            max_total_size: Self::MAX_TOTAL_SIZE,
            file_processing_timeout: Duration::from_secs(Self::FILE_TIMEOUT_SECS),
            overall_timeout: Duration::from_secs(Self::OVERALL_TIMEOUT_SECS),
            max_concurrent_reads: Self::MAX_CONCURRENT_READS,
            rate_limit_files_per_sec: 0,
            hard_memory_limit_mb: Self::HARD_MEMORY_LIMIT_MB,
            soft_memory_fraction: Self::SOFT_MEMORY_FRACTION,
            graceful_degradation: true,
            monitor_interval: Duration::from_millis(Self::MONITOR_INTERVAL_MS),
        }
    }
}

// ---- Backpressure ----

/// Queue capacities and the in-flight memory threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub enabled: bool,
    pub max_pending_files: usize,
    pub max_pending_writes: usize,
    /// Threshold for the in-flight content estimate (bytes).
    pub max_memory_usage: u64,
    /// Re-evaluate the memory estimate every this many submitted files.
    pub memory_check_interval: usize,
    /// Upper bound for a single backpressure or queue-space wait.
    #[serde(serialize_with = "serialize_secs", deserialize_with = "deserialize_secs")]
    pub max_wait: Duration,
    /// Fraction of queue capacity above which producers wait for space.
    pub queue_high_water: f64,
}

impl BackpressureConfig {
    pub const MAX_PENDING_FILES: usize = 1000;
    pub const MAX_PENDING_WRITES: usize = 100;
    pub const MAX_MEMORY_USAGE: u64 = 100 * 1024 * 1024; // 100 MB
    pub const MEMORY_CHECK_INTERVAL: usize = 1000;
    pub const MAX_WAIT_MS: u64 = 1000;
    pub const QUEUE_HIGH_WATER: f64 = 0.9;
    /// First sleep of the backoff loop; doubles up to [`Self::BACKOFF_MAX`].
    pub const BACKOFF_START: Duration = Duration::from_millis(5);
    pub const BACKOFF_MAX: Duration = Duration::from_millis(100);
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pending_files: Self::MAX_PENDING_FILES,
            max_pending_writes: Self::MAX_PENDING_WRITES,
            max_memory_usage: Self::MAX_MEMORY_USAGE,
            memory_check_interval: Self::MEMORY_CHECK_INTERVAL,
            max_wait: Duration::from_millis(Self::MAX_WAIT_MS),
            queue_high_water: Self::QUEUE_HIGH_WATER,
        }
    }
}

// ---- Collection ----

/// Rules for the default tree walker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Directory names never descended into.
    pub ignore_dirs: Vec<String>,
    /// Glob patterns (`*`, `?`) matched against file names and full paths.
    pub exclude: Vec<String>,
    /// Files larger than this are left out (bytes).
    pub max_file_size: u64,
    pub include_hidden: bool,
    pub follow_links: bool,
    pub respect_gitignore: bool,
}

impl CollectorConfig {
    pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024; // 5 MB

    pub fn default_ignore_dirs() -> Vec<String> {
        [
            ".git",
            ".hg",
            ".svn",
            "node_modules",
            "target",
            "vendor",
            "dist",
            "build",
            "__pycache__",
            ".venv",
            ".idea",
            ".vscode",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: Self::default_ignore_dirs(),
            exclude: Vec::new(),
            max_file_size: Self::MAX_FILE_SIZE,
            include_hidden: false,
            follow_links: false,
            respect_gitignore: true,
        }
    }
}

// ---- Whole run ----

/// Everything a run needs, built once and injected into each stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub format: OutputFormat,
    pub prefix: String,
    pub suffix: String,
    /// Worker count. `None` uses the available parallelism.
    pub concurrency: Option<usize>,
    /// Files at least this large are streamed to the writer instead of rendered in memory.
    pub stream_threshold: u64,
    pub collector: CollectorConfig,
    pub resources: ResourceLimits,
    pub backpressure: BackpressureConfig,
}

impl Config {
    pub const STREAM_THRESHOLD: u64 = 1024 * 1024; // 1 MB
    /// Chunk size for reading and streaming file content.
    pub const READ_CHUNK_SIZE: usize = 64 * 1024;

    /// Worker count after applying the default.
    pub fn worker_count(&self) -> usize {
        self.concurrency
            .unwrap_or_else(rayon::current_num_threads)
            .max(1)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let bad = |msg: &str| Err(PipelineError::Config(msg.to_string()));
        if self.concurrency == Some(0) {
            return bad("concurrency must be at least 1");
        }
        if self.backpressure.max_pending_files == 0 || self.backpressure.max_pending_writes == 0 {
            return bad("queue capacities must be at least 1");
        }
        if self.backpressure.memory_check_interval == 0 {
            return bad("memory_check_interval must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.backpressure.queue_high_water) {
            return bad("queue_high_water must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.resources.soft_memory_fraction) {
            return bad("soft_memory_fraction must be between 0 and 1");
        }
        if self.resources.max_concurrent_reads == 0 {
            return bad("max_concurrent_reads must be at least 1");
        }
        if self.resources.file_processing_timeout.is_zero() {
            return bad("file_processing_timeout must be positive");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            prefix: String::new(),
            suffix: String::new(),
            concurrency: None,
            stream_threshold: Self::STREAM_THRESHOLD,
            collector: CollectorConfig::default(),
            resources: ResourceLimits::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}
