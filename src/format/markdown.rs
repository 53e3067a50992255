use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::escape::{Flavor, copy_escaped};
use super::{Envelope, Formatter, OutputFormat, check_text, language_for};
use crate::error::PipelineResult;
use crate::utils::config::Config;

/// One `## File:` section per file with a fenced code block.
pub struct MarkdownFormatter;

/// Fence one backtick longer than the longest run in the content (at least three).
pub fn fence_for(content: &[u8]) -> String {
    "`".repeat(longest_backtick_run(content, 0).1.max(2) + 1)
}

/// Inline code span for `text`: the delimiter outruns any backtick run inside it, and edge
/// backticks or spaces get a padding space that renderers strip.
pub fn inline_code(text: &str) -> String {
    let ticks = "`".repeat(longest_backtick_run(text.as_bytes(), 0).1 + 1);
    let pad = if text.starts_with(['`', ' ']) || text.ends_with(['`', ' ']) {
        " "
    } else {
        ""
    };
    format!("{ticks}{pad}{text}{pad}{ticks}")
}

/// Returns (trailing run, longest run) so scans can continue across chunks.
fn longest_backtick_run(content: &[u8], carried: usize) -> (usize, usize) {
    let mut run = carried;
    let mut longest = carried;
    for &b in content {
        if b == b'`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    (run, longest)
}

impl Formatter for MarkdownFormatter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Markdown
    }

    fn open(&self, out: &mut dyn Write, envelope: &Envelope) -> io::Result<()> {
        if envelope.prefix.is_empty() {
            return Ok(());
        }
        write!(out, "{}\n\n", envelope.prefix)
    }

    fn delimiter(
        &self,
        out: &mut dyn Write,
        index: usize,
        path: &str,
        _envelope: &Envelope,
    ) -> io::Result<()> {
        if index > 0 {
            out.write_all(b"\n")?;
        }
        write!(out, "## File: {}\n\n", inline_code(path))
    }

    fn render(&self, path: &str, content: &[u8]) -> PipelineResult<String> {
        check_text(path, content)?;
        let fence = fence_for(content);
        let text = String::from_utf8_lossy(content);
        let newline = if text.is_empty() || text.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        Ok(format!(
            "{fence}{}\n{text}{newline}{fence}\n",
            language_for(path)
        ))
    }

    fn render_stream(&self, path: &str, file: &mut File, out: &mut dyn Write) -> io::Result<u64> {
        // First pass sizes the fence, second pass copies.
        let mut buf = vec![0u8; Config::READ_CHUNK_SIZE];
        let (mut run, mut longest) = (0, 0);
        let mut last = b'\n';
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let (r, l) = longest_backtick_run(&buf[..n], run);
            run = r;
            longest = longest.max(l);
            last = buf[n - 1];
        }
        let fence = "`".repeat(longest.max(2) + 1);
        file.seek(SeekFrom::Start(0))?;

        writeln!(out, "{fence}{}", language_for(path))?;
        let total = copy_escaped(file, out, Flavor::Verbatim)?;
        if last != b'\n' {
            out.write_all(b"\n")?;
        }
        writeln!(out, "{fence}")?;
        Ok(total)
    }

    fn close(&self, out: &mut dyn Write, _entries: usize, envelope: &Envelope) -> io::Result<()> {
        if envelope.suffix.is_empty() {
            return Ok(());
        }
        write!(out, "\n{}\n", envelope.suffix)
    }
}
