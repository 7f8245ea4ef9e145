//! Deciding what a truncated agent response already delivered.

use std::sync::LazyLock;

use ratchet_common::{OutputFormat, StopReason};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::format::{FileEntry, detect_format};
use super::incremental::{IncrementalParser, extract_path};
use crate::policy::patch_policy::normalize_path;
use crate::util::strip_code_fence;

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid regex")
});

/// What a truncated response delivered and what is still owed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationContext {
    pub completed_files: Vec<String>,
    pub last_partial_file: Option<String>,
    pub remaining_deliverables: Vec<String>,
    pub partial_output: String,
    pub tokens_used: u64,
    pub format_type: OutputFormat,
}

/// One file's worth of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffSection {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub text: String,
    pub complete: bool,
}

impl DiffSection {
    /// The path the section writes to, or deletes for `/dev/null` targets.
    pub fn target_path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }
}

fn header_path(rest: &str, strip: &str) -> Option<String> {
    let raw = rest.split('\t').next().unwrap_or(rest).trim();
    if raw == "/dev/null" || raw.is_empty() {
        return None;
    }
    Some(raw.strip_prefix(strip).unwrap_or(raw).to_string())
}

/// Split a unified diff into per-file sections.
///
/// A section starts at `diff --git` or at a `---` line directly followed by
/// `+++`. Text before the first section is dropped.
pub fn split_diff_sections(diff: &str) -> Vec<DiffSection> {
    let lines: Vec<&str> = diff.split_inclusive('\n').collect();
    let mut starts = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("diff --git ") {
            starts.push(i);
            // skip the header block so its ---/+++ pair is not a second start
            i += 1;
            while i < lines.len()
                && !lines[i].starts_with("@@")
                && !lines[i].starts_with("diff --git ")
            {
                i += 1;
            }
            continue;
        }
        if line.starts_with("--- ") && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ ")) {
            starts.push(i);
            i += 2;
            continue;
        }
        i += 1;
    }

    let mut sections = Vec::new();
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(lines.len());
        sections.push(parse_section(&lines[start..end]));
    }
    sections
}

fn parse_section(lines: &[&str]) -> DiffSection {
    let mut old_path = None;
    let mut new_path = None;
    let mut saw_old_header = false;
    let mut saw_new_header = false;
    let mut hunks = 0usize;
    let mut added = 0usize;
    // remaining old/new line counts for the current hunk
    let mut pending: Option<(u64, u64)> = None;
    let mut counts_ok = true;
    let mut in_hunk = false;

    for raw in lines {
        let line = raw.trim_end_matches(['\n', '\r']);
        if !in_hunk {
            if let Some(rest) = line.strip_prefix("--- ") {
                saw_old_header = true;
                old_path = header_path(rest, "a/");
                continue;
            }
            if let Some(rest) = line.strip_prefix("+++ ") {
                saw_new_header = true;
                new_path = header_path(rest, "b/");
                continue;
            }
        }
        if let Some(caps) = HUNK_RE.captures(line) {
            if let Some((old, new)) = pending
                && (old > 0 || new > 0)
            {
                counts_ok = false;
            }
            let count = |idx: usize| {
                caps.get(idx)
                    .map_or(Some(1), |m| m.as_str().parse::<u64>().ok())
            };
            match (count(2), count(4)) {
                (Some(old), Some(new)) => pending = Some((old, new)),
                _ => counts_ok = false,
            }
            hunks += 1;
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            continue;
        }
        let Some((old, new)) = pending.as_mut() else {
            continue;
        };
        if *old == 0 && *new == 0 {
            // hunk satisfied; trailing text belongs to no hunk
            in_hunk = false;
            continue;
        }
        match line.as_bytes().first() {
            Some(b'+') => {
                added += 1;
                if *new == 0 {
                    counts_ok = false;
                }
                *new = new.saturating_sub(1);
            }
            Some(b'-') => {
                if *old == 0 {
                    counts_ok = false;
                }
                *old = old.saturating_sub(1);
            }
            Some(b' ') | None => {
                if *old == 0 || *new == 0 {
                    counts_ok = false;
                }
                *old = old.saturating_sub(1);
                *new = new.saturating_sub(1);
            }
            Some(b'\\') => {}
            Some(_) => counts_ok = false,
        }
    }
    if let Some((old, new)) = pending
        && (old > 0 || new > 0)
    {
        counts_ok = false;
    }

    let complete = saw_old_header
        && saw_new_header
        && new_path.is_some()
        && hunks > 0
        && added > 0
        && counts_ok;

    DiffSection {
        old_path,
        new_path,
        text: lines.concat(),
        complete,
    }
}

/// Emitted files in `output`, split into complete ones and the one cut off.
fn scan_output(output: &str, format: OutputFormat) -> (Vec<String>, Option<String>) {
    match format {
        OutputFormat::Diff => {
            let sections = split_diff_sections(output);
            let mut completed = Vec::new();
            let mut partial = None;
            let last = sections.len().saturating_sub(1);
            for (i, section) in sections.iter().enumerate() {
                if section.complete {
                    if let Some(p) = section.new_path.as_deref() {
                        completed.push(p.to_string());
                    }
                } else if i == last {
                    partial = section.target_path().map(str::to_string);
                }
            }
            (completed, partial)
        }
        OutputFormat::FullFile => {
            let parser = IncrementalParser::parse(output);
            (
                parser.completed_paths(),
                parser.partial().and_then(|p| p.path),
            )
        }
        OutputFormat::Ndjson => {
            let mut completed = Vec::new();
            let mut partial = None;
            let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
            let last = lines.len().saturating_sub(1);
            for (i, line) in lines.iter().enumerate() {
                let parsed = serde_json::from_str::<Value>(line.trim())
                    .ok()
                    .as_ref()
                    .and_then(FileEntry::from_value);
                match parsed {
                    Some(entry) => completed.push(entry.path),
                    None if i == last => partial = extract_path(line),
                    None => {}
                }
            }
            (completed, partial)
        }
    }
}

/// Build the continuation context for a response cut off by a length limit,
/// inferring the format from the response itself.
///
/// Returns `None` for any other stop reason.
pub fn detect_truncation_context(
    raw_output: &str,
    deliverables: &[String],
    stop_reason: &StopReason,
    tokens_used: u64,
) -> Option<ContinuationContext> {
    let format = detect_format(strip_code_fence(raw_output));
    detect_truncation_context_as(format, raw_output, deliverables, stop_reason, tokens_used)
}

/// Like [`detect_truncation_context`], for a response that was requested in
/// `format_type`. The continuation keeps asking for that format.
pub fn detect_truncation_context_as(
    format_type: OutputFormat,
    raw_output: &str,
    deliverables: &[String],
    stop_reason: &StopReason,
    tokens_used: u64,
) -> Option<ContinuationContext> {
    if !stop_reason.is_truncation() {
        return None;
    }
    let body = strip_code_fence(raw_output);
    let (emitted, partial) = scan_output(body, format_type);

    let mut completed_files: Vec<String> = Vec::new();
    for path in emitted.into_iter().map(|p| normalize_path(&p)) {
        if !completed_files.contains(&path) {
            completed_files.push(path);
        }
    }
    let last_partial_file = partial
        .map(|p| normalize_path(&p))
        .filter(|p| !completed_files.contains(p));

    let mut remaining_deliverables: Vec<String> = deliverables
        .iter()
        .map(|d| normalize_path(d))
        .filter(|d| !completed_files.contains(d))
        .collect();
    if let Some(p) = &last_partial_file
        && !remaining_deliverables.contains(p)
    {
        remaining_deliverables.insert(0, p.clone());
    }

    Some(ContinuationContext {
        completed_files,
        last_partial_file,
        remaining_deliverables,
        partial_output: raw_output.to_string(),
        tokens_used,
        format_type,
    })
}
