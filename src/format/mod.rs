//! Output formats. The writer drives a [`Formatter`] for document structure (opening,
//! per-file delimiter, closing); workers call [`Formatter::render`] for each file's body.

mod escape;
mod json;
mod language;
mod markdown;
mod yaml;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};

pub use escape::{Flavor, copy_escaped, escape_into};
pub use json::JsonFormatter;
pub use language::language_for;
pub use markdown::{MarkdownFormatter, fence_for, inline_code};
pub use yaml::YamlFormatter;

/// Bytes inspected when deciding whether content is binary.
pub const BINARY_SNIFF_LEN: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
    #[serde(alias = "md")]
    #[value(alias = "md")]
    Markdown,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Markdown => "md",
        }
    }

    pub fn formatter(&self) -> Arc<dyn Formatter> {
        match self {
            OutputFormat::Json => Arc::new(JsonFormatter),
            OutputFormat::Yaml => Arc::new(YamlFormatter),
            OutputFormat::Markdown => Arc::new(MarkdownFormatter),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Markdown => "markdown",
        })
    }
}

/// Caller-supplied text wrapped around the file list.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub prefix: String,
    pub suffix: String,
}

impl Envelope {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Envelope {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty() && self.suffix.is_empty()
    }
}

/// Format-specific rendering. One instance is shared by all workers and the writer.
pub trait Formatter: Send + Sync {
    fn format(&self) -> OutputFormat;

    /// Written once, before any file.
    fn open(&self, out: &mut dyn Write, envelope: &Envelope) -> io::Result<()>;

    /// Written before the `index`-th file that reaches the writer.
    fn delimiter(
        &self,
        out: &mut dyn Write,
        index: usize,
        path: &str,
        envelope: &Envelope,
    ) -> io::Result<()>;

    /// Render one file's body in memory.
    fn render(&self, path: &str, content: &[u8]) -> PipelineResult<String>;

    /// Render one file's body from an open file without holding it in memory.
    /// Returns the number of source bytes consumed.
    fn render_stream(&self, path: &str, file: &mut File, out: &mut dyn Write) -> io::Result<u64>;

    /// Written once after the last file.
    fn close(&self, out: &mut dyn Write, entries: usize, envelope: &Envelope) -> io::Result<()>;
}

/// Refuse content that looks binary (NUL byte within the first [`BINARY_SNIFF_LEN`] bytes).
pub fn check_text(path: &str, content: &[u8]) -> PipelineResult<()> {
    let head = &content[..content.len().min(BINARY_SNIFF_LEN)];
    if head.contains(&0) {
        return Err(PipelineError::Format {
            path: path.to_string(),
            message: "binary content".to_string(),
        });
    }
    Ok(())
}
