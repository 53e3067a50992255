//! Load `.srcbundle.toml` from the source directory (CLI only). Library callers build a
//! [`Config`] themselves and inject it.

use serde::Deserialize;
use std::path::Path;

use crate::format::OutputFormat;
use crate::utils::config::{Config, PackagePaths};

#[derive(Debug, Default, Deserialize)]
pub struct BundleToml {
    #[serde(default)]
    settings: SettingsSection,
    #[serde(default)]
    limits: LimitsSection,
    #[serde(default)]
    backpressure: BackpressureSection,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsSection {
    format: Option<OutputFormat>,
    prefix: Option<String>,
    suffix: Option<String>,
    concurrency: Option<usize>,
    stream_threshold: Option<u64>,
    ignore_dirs: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    max_file_size: Option<u64>,
    include_hidden: Option<bool>,
    follow_links: Option<bool>,
    respect_gitignore: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LimitsSection {
    enabled: Option<bool>,
    max_files: Option<usize>,
    max_total_size: Option<u64>,
    file_timeout_secs: Option<f64>,
    overall_timeout_secs: Option<f64>,
    max_concurrent_reads: Option<usize>,
    rate_limit_files_per_sec: Option<u32>,
    hard_memory_limit_mb: Option<u64>,
    graceful_degradation: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct BackpressureSection {
    enabled: Option<bool>,
    max_pending_files: Option<usize>,
    max_pending_writes: Option<usize>,
    max_memory_mb: Option<u64>,
    memory_check_interval: Option<usize>,
}

/// Load the config file from `dir` if present. Returns None if missing or unreadable.
pub fn load_bundle_toml(dir: &Path) -> Option<BundleToml> {
    let path = dir.join(PackagePaths::get().config_filename());
    let s = std::fs::read_to_string(&path).ok()?;
    parse_bundle_toml(&s)
        .map_err(|e| log::warn!("{}: {}", path.display(), e))
        .ok()
}

pub fn parse_bundle_toml(s: &str) -> Result<BundleToml, toml::de::Error> {
    toml::from_str(s)
}

/// Overwrite a config field from the file when present.
macro_rules! apply_file_opt {
    ($section:expr, $target:expr, $field:ident => $target_field:ident) => {
        if let Some(v) = $section.$field.clone() {
            $target.$target_field = v;
        }
    };
}

fn secs(v: Option<f64>) -> Option<std::time::Duration> {
    v.and_then(|s| std::time::Duration::try_from_secs_f64(s).ok())
}

/// Apply file values onto `config` (only fields present in the file). Call before applying CLI flags.
pub fn apply_file_to_config(file: &BundleToml, config: &mut Config) {
    let s = &file.settings;
    apply_file_opt!(s, config, format => format);
    apply_file_opt!(s, config, prefix => prefix);
    apply_file_opt!(s, config, suffix => suffix);
    if let Some(n) = s.concurrency {
        config.concurrency = Some(n);
    }
    apply_file_opt!(s, config, stream_threshold => stream_threshold);
    apply_file_opt!(s, config.collector, ignore_dirs => ignore_dirs);
    apply_file_opt!(s, config.collector, exclude => exclude);
    apply_file_opt!(s, config.collector, max_file_size => max_file_size);
    apply_file_opt!(s, config.collector, include_hidden => include_hidden);
    apply_file_opt!(s, config.collector, follow_links => follow_links);
    apply_file_opt!(s, config.collector, respect_gitignore => respect_gitignore);

    let l = &file.limits;
    apply_file_opt!(l, config.resources, enabled => enabled);
    apply_file_opt!(l, config.resources, max_files => max_files);
    apply_file_opt!(l, config.resources, max_total_size => max_total_size);
    if let Some(d) = secs(l.file_timeout_secs) {
        config.resources.file_processing_timeout = d;
    }
    if let Some(d) = secs(l.overall_timeout_secs) {
        config.resources.overall_timeout = d;
    }
    apply_file_opt!(l, config.resources, max_concurrent_reads => max_concurrent_reads);
    apply_file_opt!(l, config.resources, rate_limit_files_per_sec => rate_limit_files_per_sec);
    apply_file_opt!(l, config.resources, hard_memory_limit_mb => hard_memory_limit_mb);
    apply_file_opt!(l, config.resources, graceful_degradation => graceful_degradation);

    let b = &file.backpressure;
    apply_file_opt!(b, config.backpressure, enabled => enabled);
    apply_file_opt!(b, config.backpressure, max_pending_files => max_pending_files);
    apply_file_opt!(b, config.backpressure, max_pending_writes => max_pending_writes);
    if let Some(mb) = b.max_memory_mb {
        config.backpressure.max_memory_usage = mb.saturating_mul(1024 * 1024);
    }
    apply_file_opt!(b, config.backpressure, memory_check_interval => memory_check_interval);
}
