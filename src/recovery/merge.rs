//! Joining a truncated response with its continuation.

use ratchet_common::OutputFormat;
use serde_json::Value;
use tracing::debug;

use super::format::FileEntry;
use super::incremental::IncrementalParser;
use super::truncation::split_diff_sections;
use crate::util::strip_code_fence;

/// Merge `partial` with `continuation` into one artifact in `format`.
pub fn merge_outputs(partial: &str, continuation: &str, format: OutputFormat) -> String {
    let partial = strip_code_fence(partial);
    let continuation = strip_code_fence(continuation);
    match format {
        OutputFormat::Diff => merge_diff(partial, continuation),
        OutputFormat::FullFile => merge_full_files(partial, continuation),
        OutputFormat::Ndjson => merge_ndjson(partial, continuation),
    }
}

fn merge_diff(partial: &str, continuation: &str) -> String {
    let sections = split_diff_sections(partial);
    let mut kept: Vec<&str> = sections
        .iter()
        .filter(|s| s.complete)
        .map(|s| s.text.as_str())
        .collect();
    let dropped = sections.len() - kept.len();
    if dropped > 0 {
        debug!(dropped, "discarding incomplete diff sections before merge");
    }

    let tail = continuation.trim_start_matches('\n');
    kept.push(tail);

    let mut merged = String::new();
    for part in kept.into_iter().filter(|p| !p.is_empty()) {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(part);
    }
    if !merged.ends_with('\n') {
        merged.push('\n');
    }
    merged
}

fn merge_full_files(partial: &str, continuation: &str) -> String {
    let mut files: Vec<FileEntry> = IncrementalParser::parse(partial).into_completed();
    for entry in IncrementalParser::parse(continuation).into_completed() {
        match files.iter_mut().find(|f| f.path == entry.path) {
            Some(existing) => *existing = entry,
            None => files.push(entry),
        }
    }
    // FileEntry serialization cannot fail
    serde_json::to_string_pretty(&files).unwrap_or_else(|_| "[]".to_string())
}

fn merge_ndjson(partial: &str, continuation: &str) -> String {
    let mut lines: Vec<&str> = partial.lines().filter(|l| !l.trim().is_empty()).collect();
    if let Some(last) = lines.last()
        && serde_json::from_str::<Value>(last.trim()).is_err()
    {
        debug!("discarding incomplete trailing ndjson line");
        lines.pop();
    }
    lines.extend(continuation.lines().filter(|l| !l.trim().is_empty()));

    let mut merged = lines.join("\n");
    merged.push('\n');
    merged
}
