use clap::Parser;
use std::path::{Path, PathBuf};

use crate::format::OutputFormat;
use crate::utils::config::PackagePaths;

struct DefaultArgs;

impl DefaultArgs {
    pub const DIR: &'static str = ".";
}

/// Aggregate a source tree into one JSON, YAML or Markdown document.
#[derive(Clone, Parser)]
#[command(name = "srcbundle")]
#[command(about = "Aggregate a directory of source files into a single document.")]
pub struct Cli {
    /// Directory to aggregate. Default: current directory.
    #[arg(value_name = "DIR", default_value = DefaultArgs::DIR)]
    pub dir: PathBuf,

    /// Output file. Default: `<dir name>.<ext>` in the current directory.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Output format. Overrides the config file.
    #[arg(long, short = 'F', value_enum)]
    pub format: Option<OutputFormat>,

    /// Text placed before the file list.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Text placed after the file list.
    #[arg(long)]
    pub suffix: Option<String>,

    /// Worker threads. Default: available parallelism.
    #[arg(long, short = 'j')]
    pub concurrency: Option<usize>,

    /// Abort before processing when more files than this are collected.
    #[arg(long)]
    pub max_files: Option<usize>,

    /// Abort before processing when collected files exceed this many bytes.
    #[arg(long)]
    pub max_total_size: Option<u64>,

    /// Per-file processing timeout in seconds.
    #[arg(long)]
    pub file_timeout: Option<f64>,

    /// Overall run timeout in seconds (0 disables).
    #[arg(long, short = 't')]
    pub timeout: Option<f64>,

    /// Maximum concurrent file reads.
    #[arg(long)]
    pub max_reads: Option<usize>,

    /// Files per second across all workers (0 disables).
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Hard process memory ceiling in MB; exceeding it stops admitting files (0 disables).
    #[arg(long)]
    pub memory_limit: Option<u64>,

    /// Disable resource ceilings (timeouts still apply).
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub no_limits: Option<bool>,

    /// Disable producer backpressure.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub no_backpressure: Option<bool>,

    /// Exclude patterns (glob syntax). Can specify multiple: -e pattern1 pattern2 pattern3
    #[arg(long, short = 'e', num_args = 1..)]
    pub exclude: Vec<String>,

    /// Extra directory names never descended into.
    #[arg(long, num_args = 1..)]
    pub ignore_dir: Vec<String>,

    /// Include hidden files and directories.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub hidden: Option<bool>,

    /// Follow symbolic links.
    #[arg(long, short = 'L', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub follow_links: Option<bool>,

    /// Do not apply .gitignore / .ignore rules.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub no_gitignore: Option<bool>,

    /// Write the processing report as JSON. Without a value: `srcbundle.report.json`.
    #[arg(long, short = 'r', num_args = 0..=1, default_missing_value = "")]
    pub report: Option<String>,

    /// Verbose output.
    #[arg(long, short = 'v', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub verbose: Option<bool>,
}

impl Cli {
    /// Output path, defaulting to `<dir name>.<ext>` in the working directory.
    pub fn output_path(&self, root: &Path, format: OutputFormat) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let dir_name = root.file_name().and_then(|n| n.to_str()).unwrap_or("");
            PathBuf::from(PackagePaths::get().output_filename(dir_name, format))
        })
    }

    /// Report path when `--report` was given.
    pub fn report_path(&self) -> Option<PathBuf> {
        self.report.as_ref().map(|p| {
            if p.is_empty() {
                PathBuf::from(PackagePaths::get().report_filename())
            } else {
                PathBuf::from(p)
            }
        })
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }
}
