use srcbundle::format::{Envelope, JsonFormatter};
use srcbundle::pipeline::CancelReason;
use srcbundle::resource::{FixedMemory, ResourceMonitor};
use srcbundle::utils::ResourceLimits;
use srcbundle::{
    Aggregator, Config, ErrorKind, Formatter, OutputFormat, PipelineError, PipelineResult,
    ProcessingContext, aggregate_dir,
};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}

fn small_config() -> Config {
    Config {
        concurrency: Some(2),
        ..Default::default()
    }
}

fn entries(output: &Path) -> Vec<serde_json::Value> {
    let text = fs::read_to_string(output).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    doc.as_array().unwrap().clone()
}

fn paths_of(entries: &[serde_json::Value]) -> BTreeSet<String> {
    entries
        .iter()
        .map(|e| e["path"].as_str().unwrap().to_string())
        .collect()
}

/// JSON formatter with an injected fault.
enum Fault {
    /// Every render takes this long.
    Slow(Duration),
    /// Only the named file's render is slow.
    SlowFor(&'static str, Duration),
    PanicInRender,
    PanicInDelimiter,
}

struct FaultyFormatter {
    fault: Fault,
}

fn faulty(fault: Fault) -> Arc<FaultyFormatter> {
    Arc::new(FaultyFormatter { fault })
}

impl Formatter for FaultyFormatter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn open(&self, out: &mut dyn Write, envelope: &Envelope) -> io::Result<()> {
        JsonFormatter.open(out, envelope)
    }

    fn delimiter(
        &self,
        out: &mut dyn Write,
        index: usize,
        path: &str,
        envelope: &Envelope,
    ) -> io::Result<()> {
        if let Fault::PanicInDelimiter = self.fault {
            panic!("delimiter for {path}");
        }
        JsonFormatter.delimiter(out, index, path, envelope)
    }

    fn render(&self, path: &str, content: &[u8]) -> PipelineResult<String> {
        match self.fault {
            Fault::Slow(delay) => thread::sleep(delay),
            Fault::SlowFor(slow, delay) if slow == path => thread::sleep(delay),
            Fault::PanicInRender => panic!("render of {path}"),
            _ => {}
        }
        JsonFormatter.render(path, content)
    }

    fn render_stream(&self, path: &str, file: &mut File, out: &mut dyn Write) -> io::Result<u64> {
        JsonFormatter.render_stream(path, file, out)
    }

    fn close(&self, out: &mut dyn Write, entries: usize, envelope: &Envelope) -> io::Result<()> {
        JsonFormatter.close(out, entries, envelope)
    }
}

/// Accepts `limit` bytes, then fails every write.
#[derive(Debug)]
struct FailingStream {
    written: usize,
    limit: usize,
}

impl Write for FailingStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.written + data.len() > self.limit {
            return Err(io::Error::other("disk full"));
        }
        self.written += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// --- happy path ---

#[test]
fn test_three_files_json_with_empty_file() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[
            ("a.rs", b"fn a() {}\n"),
            ("docs/b.txt", b"hello"),
            ("empty.md", b""),
        ],
    );
    let output = out.path().join("bundle.json");

    let aggregator = Aggregator::new(small_config()).unwrap();
    let summary = aggregator
        .run(&ProcessingContext::background(), src.path(), &output)
        .unwrap();

    assert_eq!(summary.files_collected, 3);
    assert_eq!(summary.writer.entries_written, 3);
    assert!(!summary.emergency_stop);
    assert_eq!(summary.output.as_deref(), Some(output.as_path()));
    assert_eq!(summary.report.summary.processed_files, 3);
    assert_eq!(summary.backpressure.current_memory_usage, 0);
    assert!(aggregator.monitor().is_closed());

    let files = entries(&output);
    assert_eq!(
        paths_of(&files),
        BTreeSet::from([
            "a.rs".to_string(),
            "docs/b.txt".to_string(),
            "empty.md".to_string()
        ])
    );
    let empty = files.iter().find(|e| e["path"] == "empty.md").unwrap();
    assert_eq!(empty["content"], "");
    assert_eq!(empty["language"], "markdown");
    let a = files.iter().find(|e| e["path"] == "a.rs").unwrap();
    assert_eq!(a["content"], "fn a() {}\n");
}

#[test]
fn test_markdown_run_with_envelope() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("main.go", b"package main\n")]);
    let output = out.path().join("bundle.md");

    let config = Config {
        format: OutputFormat::Markdown,
        prefix: "# Context".to_string(),
        suffix: "Done.".to_string(),
        ..small_config()
    };
    Aggregator::new(config)
        .unwrap()
        .run(&ProcessingContext::background(), src.path(), &output)
        .unwrap();

    let text = fs::read_to_string(&output).unwrap();
    assert_eq!(
        text,
        "# Context\n\n## File: `main.go`\n\n```go\npackage main\n```\n\nDone.\n"
    );
}

#[test]
fn test_empty_tree_yields_empty_document() {
    let src = tempfile::tempdir().unwrap();
    let (summary, stream) = Aggregator::new(small_config())
        .unwrap()
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();
    assert_eq!(summary.writer.entries_written, 0);
    assert_eq!(String::from_utf8(stream).unwrap(), "[]\n");
}

#[test]
fn test_large_files_are_streamed() {
    let src = tempfile::tempdir().unwrap();
    let content = "line \"quoted\"\n".repeat(20);
    write_tree(
        src.path(),
        &[("big.txt", content.as_bytes()), ("small.txt", b"tiny")],
    );
    let config = Config {
        stream_threshold: 64,
        ..small_config()
    };
    let (summary, stream) = Aggregator::new(config)
        .unwrap()
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();
    assert_eq!(summary.writer.entries_written, 2);

    let doc: serde_json::Value = serde_json::from_slice(&stream).unwrap();
    let big = doc
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["path"] == "big.txt")
        .unwrap();
    assert_eq!(big["content"], content.as_str());
}

#[test]
fn test_explicit_collector() {
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("one.py", b"1"), ("two.py", b"2")]);
    let root = src.path().canonicalize().unwrap();
    let (summary, stream) = Aggregator::new(small_config())
        .unwrap()
        .with_collector(vec![root.join("two.py")])
        .run_to_writer(&ProcessingContext::background(), &root, || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();
    assert_eq!(summary.files_collected, 1);
    let doc: serde_json::Value = serde_json::from_slice(&stream).unwrap();
    assert_eq!(doc[0]["path"], "two.py");
}

// --- collection ---

#[test]
fn test_walk_respects_gitignore_hidden_and_ignore_dirs() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[
            (".gitignore", b"*.log\n"),
            ("keep.rs", b"fn k() {}"),
            ("drop.log", b"noise"),
            (".hidden.rs", b"secret"),
            ("node_modules/dep/index.js", b"module.exports = 1;"),
        ],
    );
    let output = out.path().join("bundle.json");
    Aggregator::new(small_config())
        .unwrap()
        .run(&ProcessingContext::background(), src.path(), &output)
        .unwrap();
    assert_eq!(
        paths_of(&entries(&output)),
        BTreeSet::from(["keep.rs".to_string()])
    );
}

#[test]
fn test_output_inside_tree_is_not_collected() {
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("lib.rs", b"pub fn f() {}"), ("bundle.json", b"stale")]);
    let output = src.path().join("bundle.json");
    let summary = Aggregator::new(small_config())
        .unwrap()
        .run(&ProcessingContext::background(), src.path(), &output)
        .unwrap();
    assert_eq!(summary.files_collected, 1);
    assert_eq!(
        paths_of(&entries(&output)),
        BTreeSet::from(["lib.rs".to_string()])
    );
}

#[test]
fn test_missing_root_is_collect_error() {
    let out = tempfile::tempdir().unwrap();
    let err = Aggregator::new(small_config())
        .unwrap()
        .run(
            &ProcessingContext::background(),
            &out.path().join("does-not-exist"),
            &out.path().join("bundle.json"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Collect);
    assert!(!out.path().join("bundle.json").exists());
}

// --- admission and limits ---

#[test]
fn test_admission_failure_creates_no_output() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("a", b"1"), ("b", b"2"), ("c", b"3")]);
    let output = out.path().join("bundle.json");
    let mut config = small_config();
    config.resources.max_files = 2;

    let err = Aggregator::new(config)
        .unwrap()
        .run(&ProcessingContext::background(), src.path(), &output)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Admission);
    assert!(!output.exists());
}

#[test]
fn test_aggregate_dir_error_downcasts() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("a", b"12345"), ("b", b"67890")]);
    let output = out.path().join("bundle.json");
    let mut config = small_config();
    config.resources.max_total_size = 8;

    let err = aggregate_dir(src.path(), &output, &config).unwrap_err();
    let pipeline = err.downcast_ref::<PipelineError>().unwrap();
    assert_eq!(pipeline.kind(), ErrorKind::Admission);
    assert!(!output.exists());

    config.resources.max_total_size = 10;
    let summary = aggregate_dir(src.path(), &output, &config).unwrap();
    assert_eq!(summary.writer.entries_written, 2);
}

#[test]
fn test_binary_file_fails_alone() {
    let src = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[
            ("a.txt", b"a"),
            ("b.txt", b"b"),
            ("c.txt", b"c"),
            ("blob.bin", b"\x00\x01\x02"),
        ],
    );
    let aggregator = Aggregator::new(small_config()).unwrap();
    let (summary, stream) = aggregator
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();

    let report = &summary.report;
    assert_eq!(report.summary.total_files, 4);
    assert_eq!(report.summary.failed_files, 1);
    assert_eq!(report.error_kinds.get("format"), Some(&1));
    assert_eq!(
        report.summary.processed_files,
        report.summary.total_files - report.summary.skipped_files - report.summary.failed_files
    );
    assert_eq!(summary.writer.entries_written, 3);
    let doc: serde_json::Value = serde_json::from_slice(&stream).unwrap();
    assert_eq!(doc.as_array().unwrap().len(), 3);
}

#[test]
fn test_emergency_stop_returns_partial_document() {
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("a", b"1"), ("b", b"2"), ("c", b"3")]);
    let mem = Arc::new(FixedMemory::new(4 * 1024 * 1024));
    let monitor = Arc::new(ResourceMonitor::with_sampler(
        ResourceLimits {
            hard_memory_limit_mb: 1,
            ..Default::default()
        },
        Box::new(mem.clone()),
    ));
    monitor.check_memory();

    let aggregator = Aggregator::new(small_config())
        .unwrap()
        .with_monitor(monitor);
    let (summary, stream) = aggregator
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();

    assert!(summary.emergency_stop);
    assert_eq!(summary.writer.entries_written, 0);
    assert_eq!(summary.report.skip_reasons.get("emergency stop"), Some(&3));
    assert_eq!(String::from_utf8(stream).unwrap(), "[]\n");
}

// --- cancellation, deadlines, write failure ---

#[test]
fn test_overall_timeout_is_fatal() {
    let src = tempfile::tempdir().unwrap();
    for i in 0..5 {
        fs::write(src.path().join(format!("f{i}.txt")), "x").unwrap();
    }
    let mut config = small_config();
    config.resources.overall_timeout = Duration::from_millis(1);

    let aggregator = Aggregator::new(config).unwrap().with_formatter(faulty(Fault::Slow(Duration::from_millis(50))));
    let err = aggregator
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    let outcomes = aggregator.metrics().outcomes();
    assert!(outcomes.iter().any(|o| matches!(
        o.skip_reason(),
        Some("timeout") | Some("context canceled")
    )));
    assert!(aggregator.monitor().is_closed());
}

#[test]
fn test_per_file_timeout_skips_only_that_file() {
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("a.txt", b"a"), ("b.txt", b"b")]);
    let mut config = small_config();
    config.resources.file_processing_timeout = Duration::from_millis(5);

    let aggregator = Aggregator::new(config).unwrap().with_formatter(faulty(Fault::Slow(Duration::from_millis(30))));
    let (summary, stream) = aggregator
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();
    assert_eq!(summary.report.skip_reasons.get("timeout"), Some(&2));
    assert_eq!(summary.writer.entries_written, 0);
    assert_eq!(String::from_utf8(stream).unwrap(), "[]\n");
}

#[test]
fn test_cancel_with_tiny_queues_does_not_deadlock() {
    let src = tempfile::tempdir().unwrap();
    for i in 0..50 {
        fs::write(src.path().join(format!("f{i:02}.txt")), "x").unwrap();
    }
    let mut config = Config {
        concurrency: Some(4),
        ..Default::default()
    };
    config.backpressure.max_pending_files = 1;
    config.backpressure.max_pending_writes = 1;

    let (ctx, handle) = ProcessingContext::background().with_cancel();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.cancel();
    });

    let aggregator = Aggregator::new(config).unwrap().with_formatter(faulty(Fault::Slow(Duration::from_millis(10))));
    let start = Instant::now();
    let err = aggregator
        .run_to_writer(&ctx, src.path(), || Ok(Vec::<u8>::new()))
        .unwrap_err();
    canceller.join().unwrap();

    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(ctx.err(), Some(CancelReason::Canceled));

    // Every collected file is accounted for exactly once.
    let outcomes = aggregator.metrics().outcomes();
    assert_eq!(outcomes.len(), 50);
    assert_eq!(aggregator.backpressure().current_memory_usage(), 0);
}

#[test]
fn test_tiny_queues_complete() {
    let src = tempfile::tempdir().unwrap();
    for i in 0..100 {
        fs::write(src.path().join(format!("f{i:03}.rs")), format!("// {i}\n")).unwrap();
    }
    let mut config = Config {
        concurrency: Some(8),
        ..Default::default()
    };
    config.backpressure.max_pending_files = 1;
    config.backpressure.max_pending_writes = 1;
    config.backpressure.memory_check_interval = 1;
    config.backpressure.max_memory_usage = 1;
    config.backpressure.max_wait = Duration::from_millis(20);

    let (summary, stream) = Aggregator::new(config)
        .unwrap()
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();
    assert_eq!(summary.writer.entries_written, 100);
    let doc: serde_json::Value = serde_json::from_slice(&stream).unwrap();
    let paths: BTreeSet<PathBuf> = doc
        .as_array()
        .unwrap()
        .iter()
        .map(|e| PathBuf::from(e["path"].as_str().unwrap()))
        .collect();
    assert_eq!(paths.len(), 100);
}

#[test]
fn test_write_failure_is_fatal() {
    let src = tempfile::tempdir().unwrap();
    for i in 0..20 {
        fs::write(src.path().join(format!("f{i}.txt")), "x".repeat(50)).unwrap();
    }
    let err = Aggregator::new(small_config())
        .unwrap()
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(FailingStream {
                written: 0,
                limit: 100,
            })
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Write);
    assert!(err.is_fatal());
}

// --- ordering and thread panics ---

#[test]
fn test_output_is_in_completion_order() {
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("a_slow.txt", b"slow"), ("b_fast.txt", b"fast")]);
    let aggregator = Aggregator::new(small_config()).unwrap().with_formatter(faulty(
        Fault::SlowFor("a_slow.txt", Duration::from_millis(300)),
    ));
    let (summary, stream) = aggregator
        .run_to_writer(&ProcessingContext::background(), src.path(), || {
            Ok(Vec::<u8>::new())
        })
        .unwrap();
    assert_eq!(summary.writer.entries_written, 2);

    let doc: serde_json::Value = serde_json::from_slice(&stream).unwrap();
    let order: Vec<&str> = doc
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["path"].as_str().unwrap())
        .collect();
    assert_eq!(order, ["b_fast.txt", "a_slow.txt"]);
}

/// Run a 50-file tree through tiny queues with `fault` on another thread; the result must
/// arrive well before the default overall timeout.
fn run_with_fault(fault: Fault) -> PipelineResult<(srcbundle::RunSummary, Vec<u8>)> {
    let src = tempfile::tempdir().unwrap();
    for i in 0..50 {
        fs::write(src.path().join(format!("f{i:02}.txt")), "x").unwrap();
    }
    let mut config = small_config();
    config.backpressure.max_pending_files = 1;
    config.backpressure.max_pending_writes = 1;
    let root = src.path().to_path_buf();

    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let aggregator = Aggregator::new(config).unwrap().with_formatter(faulty(fault));
        let result = aggregator.run_to_writer(&ProcessingContext::background(), &root, || {
            Ok(Vec::<u8>::new())
        });
        let _ = tx.send(result);
    });
    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("run hung after a pipeline thread panicked");
    drop(src);
    result
}

#[test]
fn test_worker_panic_fails_run_without_hanging() {
    let err = run_with_fault(Fault::PanicInRender).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Panicked);
    assert!(err.is_fatal());
}

#[test]
fn test_writer_panic_fails_run_without_hanging() {
    let err = run_with_fault(Fault::PanicInDelimiter).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Panicked);
}
