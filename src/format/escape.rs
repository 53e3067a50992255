//! Double-quoted string escaping shared by the JSON and YAML formatters, in memory and streamed,
//! plus the lossy pass-through Markdown uses for fenced content.

use std::fmt::Write as _;
use std::io::{self, Read, Write};

use crate::utils::config::Config;

/// Target grammar. YAML additionally escapes characters outside its printable set.
/// `Verbatim` escapes nothing and only replaces invalid UTF-8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    Json,
    Yaml,
    Verbatim,
}

// NEL (U+0085) is printable in YAML but a line break; parsers fold it inside quoted scalars.
fn yaml_unprintable(c: char) -> bool {
    matches!(c, '\u{7f}'..='\u{9f}' | '\u{2028}' | '\u{2029}' | '\u{fffe}' | '\u{ffff}')
}

/// Append `s` escaped for a double-quoted scalar (without the quotes).
pub fn escape_into(out: &mut String, s: &str, flavor: Flavor) {
    if flavor == Flavor::Verbatim {
        out.push_str(s);
        return;
    }
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c if flavor == Flavor::Yaml && yaml_unprintable(c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

/// Escape the valid UTF-8 prefix of `bytes` into `out`, replacing invalid sequences with U+FFFD.
/// Returns the trailing bytes of an incomplete sequence, to be prepended to the next chunk.
fn escape_lossy<'a>(mut bytes: &'a [u8], out: &mut String, flavor: Flavor) -> &'a [u8] {
    loop {
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                escape_into(out, s, flavor);
                return &[];
            }
            Err(e) => {
                let (valid, after) = bytes.split_at(e.valid_up_to());
                escape_into(out, std::str::from_utf8(valid).unwrap_or_default(), flavor);
                match e.error_len() {
                    Some(len) => {
                        out.push('\u{fffd}');
                        bytes = &after[len..];
                    }
                    None => return after,
                }
            }
        }
    }
}

/// Copy `reader` into `out` escaped, chunk by chunk. Returns source bytes read.
pub fn copy_escaped<R: Read + ?Sized>(
    reader: &mut R,
    out: &mut dyn Write,
    flavor: Flavor,
) -> io::Result<u64> {
    let mut buf = vec![0u8; Config::READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    let mut escaped = String::with_capacity(Config::READ_CHUNK_SIZE + Config::READ_CHUNK_SIZE / 8);
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        total += n as u64;
        let mut chunk = std::mem::take(&mut pending);
        chunk.extend_from_slice(&buf[..n]);
        escaped.clear();
        let rest = escape_lossy(&chunk, &mut escaped, flavor);
        pending.extend_from_slice(rest);
        out.write_all(escaped.as_bytes())?;
    }
    if !pending.is_empty() {
        out.write_all("\u{fffd}".as_bytes())?;
    }
    Ok(total)
}
