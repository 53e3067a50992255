use srcbundle::format::{
    Envelope, Flavor, Formatter, JsonFormatter, MarkdownFormatter, OutputFormat, YamlFormatter,
    copy_escaped, fence_for, inline_code,
};
use srcbundle::ErrorKind;
use std::fs::File;
use std::io::Write;

/// Drive a formatter the way the writer does, with every file rendered in memory.
fn document(f: &dyn Formatter, envelope: &Envelope, files: &[(&str, &[u8])]) -> String {
    let mut out: Vec<u8> = Vec::new();
    f.open(&mut out, envelope).unwrap();
    for (i, (path, content)) in files.iter().enumerate() {
        f.delimiter(&mut out, i, path, envelope).unwrap();
        let rendered = f.render(path, content).unwrap();
        out.extend_from_slice(rendered.as_bytes());
    }
    f.close(&mut out, files.len(), envelope).unwrap();
    String::from_utf8(out).unwrap()
}

fn temp_file_with(content: &[u8]) -> File {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(content).unwrap();
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(0)).unwrap();
    file
}

// --- OutputFormat ---

#[test]
fn test_output_format_extension_and_formatter() {
    assert_eq!(OutputFormat::Json.extension(), "json");
    assert_eq!(OutputFormat::Yaml.extension(), "yaml");
    assert_eq!(OutputFormat::Markdown.extension(), "md");
    for format in [OutputFormat::Json, OutputFormat::Yaml, OutputFormat::Markdown] {
        assert_eq!(format.formatter().format(), format);
    }
}

// --- JSON ---

#[test]
fn test_json_single_file_round_trip() {
    let doc = document(
        &JsonFormatter,
        &Envelope::default(),
        &[("src/main.rs", b"fn main() {\n    println!(\"hi\");\n}\n")],
    );
    let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
    let files = value.as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "src/main.rs");
    assert_eq!(files[0]["language"], "rust");
    assert_eq!(
        files[0]["content"],
        "fn main() {\n    println!(\"hi\");\n}\n"
    );
}

#[test]
fn test_json_empty_document() {
    let doc = document(&JsonFormatter, &Envelope::default(), &[]);
    assert_eq!(doc, "[]\n");
}

#[test]
fn test_json_envelope() {
    let envelope = Envelope::new("before", "after");
    let doc = document(&JsonFormatter, &envelope, &[("a.txt", b"x"), ("b.txt", b"")]);
    let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
    assert_eq!(value["prefix"], "before");
    assert_eq!(value["suffix"], "after");
    assert_eq!(value["files"].as_array().unwrap().len(), 2);
    assert_eq!(value["files"][1]["content"], "");
}

#[test]
fn test_json_stream_matches_render() {
    // Multi-byte characters straddle the 64 KiB read chunks.
    let content = "日".repeat(30_000) + "\"quoted\"\ttab\n";
    let rendered = JsonFormatter.render("big.txt", content.as_bytes()).unwrap();

    let mut streamed: Vec<u8> = Vec::new();
    let mut file = temp_file_with(content.as_bytes());
    let n = JsonFormatter
        .render_stream("big.txt", &mut file, &mut streamed)
        .unwrap();
    assert_eq!(n, content.len() as u64);

    let a: serde_json::Value = serde_json::from_str(&rendered).unwrap();
    let b: serde_json::Value = serde_json::from_slice(&streamed).unwrap();
    assert_eq!(a, b);
    assert_eq!(b["content"], content.as_str());
}

#[test]
fn test_binary_content_refused() {
    let err = JsonFormatter.render("blob.bin", b"abc\0def").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(YamlFormatter.render("blob.bin", b"\0").is_err());
    assert!(MarkdownFormatter.render("blob.bin", b"\0").is_err());
}

#[test]
fn test_invalid_utf8_replaced() {
    let doc = document(&JsonFormatter, &Envelope::default(), &[("x.txt", b"a\xffb")]);
    let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
    assert_eq!(value[0]["content"], "a\u{fffd}b");
}

// --- copy_escaped ---

#[test]
fn test_copy_escaped_truncated_sequence_at_end() {
    let mut out: Vec<u8> = Vec::new();
    let mut input: &[u8] = b"ok\xc3";
    let n = copy_escaped(&mut input, &mut out, Flavor::Json).unwrap();
    assert_eq!(n, 3);
    assert_eq!(String::from_utf8(out).unwrap(), "ok\u{fffd}");
}

#[test]
fn test_copy_escaped_yaml_escapes_del() {
    let mut out: Vec<u8> = Vec::new();
    let mut input: &[u8] = b"a\x7fb";
    copy_escaped(&mut input, &mut out, Flavor::Yaml).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "a\\u007fb");
}

// --- YAML ---

fn parse_yaml(doc: &str) -> serde_yaml::Value {
    serde_yaml::from_str(doc).unwrap()
}

#[test]
fn test_yaml_single_file() {
    let doc = document(
        &YamlFormatter,
        &Envelope::default(),
        &[("lib/a.py", b"print(\"x\")\n")],
    );
    assert!(doc.starts_with("- path: \"lib/a.py\"\n"));
    assert!(doc.ends_with('\n'));

    let parsed = parse_yaml(&doc);
    let files = parsed.as_sequence().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"].as_str(), Some("lib/a.py"));
    assert_eq!(files[0]["language"].as_str(), Some("python"));
    assert_eq!(files[0]["content"].as_str(), Some("print(\"x\")\n"));
}

#[test]
fn test_yaml_two_files_and_envelope() {
    let envelope = Envelope::new("intro", "outro");
    let doc = document(&YamlFormatter, &envelope, &[("a.rs", b"1"), ("b.rs", b"2")]);
    assert!(doc.starts_with("prefix: \"intro\"\nfiles:\n- path: \"a.rs\""));
    assert!(doc.ends_with("suffix: \"outro\"\n"));

    let parsed = parse_yaml(&doc);
    assert_eq!(parsed["prefix"].as_str(), Some("intro"));
    assert_eq!(parsed["suffix"].as_str(), Some("outro"));
    let files = parsed["files"].as_sequence().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[1]["path"].as_str(), Some("b.rs"));
    assert_eq!(files[1]["content"].as_str(), Some("2"));
}

#[test]
fn test_yaml_empty_document() {
    let doc = document(&YamlFormatter, &Envelope::default(), &[]);
    assert_eq!(doc, "[]\n");
    assert_eq!(parse_yaml(&doc).as_sequence().map(|s| s.len()), Some(0));

    let parsed = parse_yaml(&document(&YamlFormatter, &Envelope::new("p", "s"), &[]));
    assert_eq!(parsed["files"].as_sequence().map(|s| s.len()), Some(0));
    assert_eq!(parsed["suffix"].as_str(), Some("s"));
}

#[test]
fn test_yaml_line_break_characters_survive() {
    // NEL and the Unicode line/paragraph separators are folded by parsers unless escaped.
    let content = "nel\u{85}x ls\u{2028}ps\u{2029} del\u{7f} c1\u{9f}\ttab\r\n".as_bytes();
    let doc = document(&YamlFormatter, &Envelope::default(), &[("odd.txt", content)]);
    assert!(doc.contains("\\u0085"));
    assert!(doc.contains("\\u2028"));

    let parsed = parse_yaml(&doc);
    assert_eq!(
        parsed[0]["content"].as_str(),
        Some(std::str::from_utf8(content).unwrap())
    );
}

#[test]
fn test_yaml_stream_matches_render() {
    let content = "line one\nline \"two\"\nnel\u{85}end".as_bytes();
    let rendered = YamlFormatter.render("t.txt", content).unwrap();
    let mut streamed: Vec<u8> = Vec::new();
    let mut file = temp_file_with(content);
    YamlFormatter
        .render_stream("t.txt", &mut file, &mut streamed)
        .unwrap();
    assert_eq!(rendered.as_bytes(), streamed.as_slice());

    let doc = format!("- {}\n", String::from_utf8(streamed).unwrap());
    assert_eq!(
        parse_yaml(&doc)[0]["content"].as_str(),
        Some(std::str::from_utf8(content).unwrap())
    );
}

// --- Markdown ---

#[test]
fn test_fence_longer_than_content_backticks() {
    assert_eq!(fence_for(b"plain"), "```");
    assert_eq!(fence_for(b"a ``` b"), "````");
    assert_eq!(fence_for(b"`````"), "``````");
}

#[test]
fn test_markdown_single_file() {
    let doc = document(
        &MarkdownFormatter,
        &Envelope::default(),
        &[("src/lib.rs", b"pub fn f() {}")],
    );
    assert_eq!(
        doc,
        "## File: `src/lib.rs`\n\n```rust\npub fn f() {}\n```\n"
    );
}

#[test]
fn test_markdown_nested_fence_and_envelope() {
    let envelope = Envelope::new("# Bundle", "End.");
    let doc = document(
        &MarkdownFormatter,
        &envelope,
        &[("README.md", b"```sh\nls\n```\n"), ("a.go", b"package a\n")],
    );
    assert!(doc.starts_with("# Bundle\n\n## File: `README.md`\n\n````markdown\n"));
    assert!(doc.contains("```\n````\n\n## File: `a.go`\n\n```go\npackage a\n```\n"));
    assert!(doc.ends_with("\nEnd.\n"));
}

#[test]
fn test_markdown_stream_matches_render() {
    let content = b"x ```` y\nno newline at end";
    let rendered = MarkdownFormatter.render("n.txt", content).unwrap();
    let mut streamed: Vec<u8> = Vec::new();
    let mut file = temp_file_with(content);
    MarkdownFormatter
        .render_stream("n.txt", &mut file, &mut streamed)
        .unwrap();
    assert_eq!(rendered.as_bytes(), streamed.as_slice());
}

#[test]
fn test_markdown_stream_matches_render_with_invalid_utf8() {
    for content in [&b"a\xffb\n"[..], b"bad \xc3(\n", b"ends mid char \xe6\x97"] {
        let rendered = MarkdownFormatter.render("bin.txt", content).unwrap();
        let mut streamed: Vec<u8> = Vec::new();
        let mut file = temp_file_with(content);
        let n = MarkdownFormatter
            .render_stream("bin.txt", &mut file, &mut streamed)
            .unwrap();
        assert_eq!(n, content.len() as u64);
        assert_eq!(rendered.as_bytes(), streamed.as_slice());
        assert!(String::from_utf8(streamed).unwrap().contains('\u{fffd}'));
    }
}

#[test]
fn test_markdown_header_path_with_backticks() {
    assert_eq!(inline_code("src/lib.rs"), "`src/lib.rs`");
    assert_eq!(inline_code("a`b.rs"), "``a`b.rs``");
    assert_eq!(inline_code("`x``.rs"), "``` `x``.rs ```");

    let doc = document(&MarkdownFormatter, &Envelope::default(), &[("a`b.rs", b"x\n")]);
    assert!(doc.starts_with("## File: ``a`b.rs``\n\n```rust\n"));
}

// --- Verbatim ---

#[test]
fn test_copy_escaped_verbatim_only_replaces_invalid_utf8() {
    let mut out: Vec<u8> = Vec::new();
    let mut input: &[u8] = b"q\"\\\n\x7f\xff";
    let n = copy_escaped(&mut input, &mut out, Flavor::Verbatim).unwrap();
    assert_eq!(n, 6);
    assert_eq!(String::from_utf8(out).unwrap(), "q\"\\\n\u{7f}\u{fffd}");
}
