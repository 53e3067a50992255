use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};

use super::escape::{Flavor, copy_escaped};
use super::{Envelope, Formatter, OutputFormat, check_text, language_for};
use crate::error::{PipelineError, PipelineResult};

/// Bare array of file objects, or `{"prefix", "files", "suffix"}` when an envelope is set.
pub struct JsonFormatter;

#[derive(Serialize)]
struct JsonEntry<'a> {
    path: &'a str,
    language: &'a str,
    content: &'a str,
}

fn json_string(s: &str) -> io::Result<String> {
    serde_json::to_string(s).map_err(io::Error::other)
}

impl Formatter for JsonFormatter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn open(&self, out: &mut dyn Write, envelope: &Envelope) -> io::Result<()> {
        if envelope.is_empty() {
            out.write_all(b"[")
        } else {
            write!(out, "{{\"prefix\":{},\"files\":[", json_string(&envelope.prefix)?)
        }
    }

    fn delimiter(
        &self,
        out: &mut dyn Write,
        index: usize,
        _path: &str,
        _envelope: &Envelope,
    ) -> io::Result<()> {
        if index == 0 {
            out.write_all(b"\n  ")
        } else {
            out.write_all(b",\n  ")
        }
    }

    fn render(&self, path: &str, content: &[u8]) -> PipelineResult<String> {
        check_text(path, content)?;
        let content = String::from_utf8_lossy(content);
        let entry = JsonEntry {
            path,
            language: language_for(path),
            content: &content,
        };
        serde_json::to_string(&entry).map_err(|e| PipelineError::Format {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    fn render_stream(&self, path: &str, file: &mut File, out: &mut dyn Write) -> io::Result<u64> {
        write!(
            out,
            "{{\"path\":{},\"language\":{},\"content\":\"",
            json_string(path)?,
            json_string(language_for(path))?
        )?;
        let n = copy_escaped(file, out, Flavor::Json)?;
        out.write_all(b"\"}")?;
        Ok(n)
    }

    fn close(&self, out: &mut dyn Write, entries: usize, envelope: &Envelope) -> io::Result<()> {
        if entries > 0 {
            out.write_all(b"\n")?;
        }
        out.write_all(b"]")?;
        if !envelope.is_empty() {
            write!(out, ",\"suffix\":{}}}", json_string(&envelope.suffix)?)?;
        }
        out.write_all(b"\n")
    }
}
