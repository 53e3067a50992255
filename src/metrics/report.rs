use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::Phase;
use super::collector::MetricsSnapshot;
use crate::types::{FileOutcome, OutcomeStatus};
use crate::utils::config::serialize_secs;

/// Number of entries kept in the slowest-files list.
const SLOWEST_FILES: usize = 5;
/// Failure share above which the report suggests investigating errors.
const FAILURE_RATIO_WARN: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub path: String,
    pub size: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

/// Final rollup of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub summary: MetricsSnapshot,
    pub languages: BTreeMap<String, u64>,
    pub skip_reasons: BTreeMap<String, u64>,
    pub error_kinds: BTreeMap<String, u64>,
    pub largest_file: Option<FileSummary>,
    pub smallest_file: Option<FileSummary>,
    pub average_file_size: u64,
    pub slowest_files: Vec<FileSummary>,
    /// Seconds per phase.
    pub phase_timings: BTreeMap<&'static str, f64>,
    pub recommendations: Vec<String>,
}

fn summary_of(o: &FileOutcome) -> FileSummary {
    FileSummary {
        path: o.path.clone(),
        size: o.size,
        elapsed: o.elapsed,
    }
}

pub(super) fn build(
    summary: MetricsSnapshot,
    outcomes: &[FileOutcome],
    phases: &BTreeMap<Phase, Duration>,
) -> ProcessingReport {
    let mut languages = BTreeMap::new();
    let mut skip_reasons = BTreeMap::new();
    let mut error_kinds = BTreeMap::new();
    let mut processed: Vec<&FileOutcome> = Vec::new();

    for o in outcomes {
        match &o.status {
            OutcomeStatus::Processed => {
                let lang = if o.language.is_empty() {
                    "other"
                } else {
                    o.language.as_str()
                };
                *languages.entry(lang.to_string()).or_insert(0) += 1;
                processed.push(o);
            }
            OutcomeStatus::Skipped { reason } => {
                *skip_reasons.entry(reason.clone()).or_insert(0) += 1;
            }
            OutcomeStatus::Failed { kind, .. } => {
                *error_kinds.entry(kind.clone()).or_insert(0) += 1;
            }
        }
    }

    let largest_file = processed.iter().max_by_key(|o| o.size).map(|o| summary_of(o));
    let smallest_file = processed.iter().min_by_key(|o| o.size).map(|o| summary_of(o));
    let total_bytes: u64 = processed.iter().map(|o| o.size).sum();
    let average_file_size = total_bytes
        .checked_div(processed.len() as u64)
        .unwrap_or(0);

    processed.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
    let slowest_files = processed
        .iter()
        .take(SLOWEST_FILES)
        .map(|o| summary_of(o))
        .collect();

    let phase_timings = phases
        .iter()
        .map(|(p, d)| (p.as_str(), d.as_secs_f64()))
        .collect();

    let recommendations = recommend(&summary, &skip_reasons, &error_kinds);

    ProcessingReport {
        summary,
        languages,
        skip_reasons,
        error_kinds,
        largest_file,
        smallest_file,
        average_file_size,
        slowest_files,
        phase_timings,
        recommendations,
    }
}

fn recommend(
    summary: &MetricsSnapshot,
    skip_reasons: &BTreeMap<String, u64>,
    error_kinds: &BTreeMap<String, u64>,
) -> Vec<String> {
    let mut out = Vec::new();
    if summary.total_files > 0 {
        let ratio = summary.failed_files as f64 / summary.total_files as f64;
        if ratio > FAILURE_RATIO_WARN {
            out.push(format!(
                "{:.0}% of files failed; check the error kinds above",
                ratio * 100.0
            ));
        }
    }
    if skip_reasons.contains_key("emergency stop") {
        out.push("Emergency stop was hit; raise the hard memory limit or lower concurrency".into());
    }
    if skip_reasons.contains_key("timeout") || error_kinds.contains_key("file_timeout") {
        out.push("Files timed out; raise the per-file or overall timeout".into());
    }
    if skip_reasons.contains_key("file limit") || skip_reasons.contains_key("size limit") {
        out.push("Resource limits skipped files; raise max_files or max_total_size".into());
    }
    if summary.peak_concurrency <= 1 && summary.processed_files > 100 {
        out.push("Only one file was read at a time; consider raising concurrency".into());
    }
    out
}

impl fmt::Display for ProcessingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.summary;
        writeln!(
            f,
            "Processed {} of {} files ({} skipped, {} failed), {} bytes in {:.2}s ({:.1} files/s)",
            s.processed_files,
            s.total_files,
            s.skipped_files,
            s.failed_files,
            s.processed_bytes,
            s.elapsed.as_secs_f64(),
            s.files_per_sec
        )?;
        if !self.languages.is_empty() {
            let langs: Vec<String> = self
                .languages
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            writeln!(f, "  languages: {}", langs.join(", "))?;
        }
        for (reason, n) in &self.skip_reasons {
            writeln!(f, "  skipped ({reason}): {n}")?;
        }
        for (kind, n) in &self.error_kinds {
            writeln!(f, "  failed ({kind}): {n}")?;
        }
        if let Some(l) = &self.largest_file {
            writeln!(f, "  largest: {} ({} bytes)", l.path, l.size)?;
        }
        for (phase, secs) in &self.phase_timings {
            writeln!(f, "  {phase}: {secs:.3}s")?;
        }
        for r in &self.recommendations {
            writeln!(f, "  hint: {r}")?;
        }
        Ok(())
    }
}
