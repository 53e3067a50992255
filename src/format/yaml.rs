use std::fs::File;
use std::io::{self, Write};

use super::escape::{Flavor, copy_escaped, escape_into};
use super::{Envelope, Formatter, OutputFormat, check_text, language_for};
use crate::error::PipelineResult;

/// Block sequence of `path`/`language`/`content` mappings. Scalars are double-quoted so any
/// content survives without indentation rules. With an envelope the sequence sits under `files:`.
pub struct YamlFormatter;

fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    escape_into(&mut out, s, Flavor::Yaml);
    out.push('"');
    out
}

impl Formatter for YamlFormatter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Yaml
    }

    fn open(&self, out: &mut dyn Write, envelope: &Envelope) -> io::Result<()> {
        if envelope.is_empty() {
            return Ok(());
        }
        write!(out, "prefix: {}\nfiles:", quoted(&envelope.prefix))
    }

    fn delimiter(
        &self,
        out: &mut dyn Write,
        index: usize,
        _path: &str,
        envelope: &Envelope,
    ) -> io::Result<()> {
        if index == 0 && envelope.is_empty() {
            out.write_all(b"- ")
        } else {
            out.write_all(b"\n- ")
        }
    }

    fn render(&self, path: &str, content: &[u8]) -> PipelineResult<String> {
        check_text(path, content)?;
        let content = String::from_utf8_lossy(content);
        Ok(format!(
            "path: {}\n  language: {}\n  content: {}",
            quoted(path),
            quoted(language_for(path)),
            quoted(&content)
        ))
    }

    fn render_stream(&self, path: &str, file: &mut File, out: &mut dyn Write) -> io::Result<u64> {
        write!(
            out,
            "path: {}\n  language: {}\n  content: \"",
            quoted(path),
            quoted(language_for(path))
        )?;
        let n = copy_escaped(file, out, Flavor::Yaml)?;
        out.write_all(b"\"")?;
        Ok(n)
    }

    fn close(&self, out: &mut dyn Write, entries: usize, envelope: &Envelope) -> io::Result<()> {
        if entries == 0 {
            let empty: &[u8] = if envelope.is_empty() { b"[]" } else { b" []" };
            out.write_all(empty)?;
        }
        out.write_all(b"\n")?;
        if !envelope.is_empty() {
            writeln!(out, "suffix: {}", quoted(&envelope.suffix))?;
        }
        Ok(())
    }
}
