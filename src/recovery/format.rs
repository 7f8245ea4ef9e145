//! Output format detection and the shared file-entry shape.

use ratchet_common::OutputFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::strip_code_fence;

/// One emitted file in the JSON-array or NDJSON formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "file_path")]
    pub path: String,
    pub content: String,
}

impl FileEntry {
    /// Accepts either `file_path` or `path` as the key.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let path = obj
            .get("file_path")
            .or_else(|| obj.get("path"))?
            .as_str()?;
        let content = obj.get("content")?.as_str()?;
        Some(Self {
            path: path.to_string(),
            content: content.to_string(),
        })
    }
}

/// Pick the parser for `output` from its structural markers.
///
/// A JSON payload introduced by a line of prose is still recognized, unless
/// the text also carries diff markers. Text with no recognizable markers is
/// treated as a diff.
pub fn detect_format(output: &str) -> OutputFormat {
    let body = strip_code_fence(output).trim_start();
    if let Some(format) = structured_format(body) {
        return format;
    }
    if !has_diff_markers(body)
        && let Some(start) = json_payload_start(body)
        && let Some(format) = structured_format(&body[start..])
    {
        return format;
    }
    OutputFormat::Diff
}

fn structured_format(body: &str) -> Option<OutputFormat> {
    if body.starts_with('[') {
        let head: String = body.chars().take(200).collect();
        if head.contains('{') {
            return Some(OutputFormat::FullFile);
        }
    }
    if body.starts_with('{') {
        return Some(OutputFormat::Ndjson);
    }
    None
}

/// Byte offset of the first line that opens a JSON array or object.
fn json_payload_start(body: &str) -> Option<usize> {
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            return Some(offset + line.len() - trimmed.len());
        }
        offset += line.len();
    }
    None
}

/// True if `output` contains any unified-diff marker.
pub fn has_diff_markers(output: &str) -> bool {
    output.lines().any(|l| {
        l.starts_with("diff --git ") || l.starts_with("+++ ") || l.starts_with("@@ ")
    })
}
