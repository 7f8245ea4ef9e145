//! Incremental parser for a top-level JSON array of file objects.
//!
//! Object boundaries are found with a byte scanner that tracks string state,
//! escapes and brace depth, so a truncated stream still yields every closed
//! object. The dangling object's path is recovered with a regex over the
//! unclosed fragment.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::format::FileEntry;

static PATH_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:file_path|path)"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex")
});

/// The object that was still open when input ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialObject {
    /// Best-effort path of the file being emitted.
    pub path: Option<String>,
    /// Raw text from the object's opening brace to the end of input.
    pub fragment: String,
}

#[derive(Debug, Default)]
pub struct IncrementalParser {
    buf: String,
    /// Next byte of `buf` to scan.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    object_start: Option<usize>,
    completed: Vec<FileEntry>,
    /// Closed objects that did not parse as file entries.
    rejected: usize,
}

impl IncrementalParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a complete buffer in one go.
    pub fn parse(text: &str) -> Self {
        let mut parser = Self::new();
        parser.feed(text);
        parser
    }

    pub fn feed(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        let bytes = self.buf.as_bytes();
        let mut closed = Vec::new();

        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' if self.depth > 0 => self.in_string = true,
                    b'{' => {
                        if self.depth == 0 {
                            self.object_start = Some(self.pos);
                        }
                        self.depth += 1;
                    }
                    b'}' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0
                            && let Some(start) = self.object_start.take()
                        {
                            closed.push((start, self.pos + 1));
                        }
                    }
                    _ => {}
                }
            }
            self.pos += 1;
        }

        for (start, end) in closed {
            let raw = &self.buf[start..end];
            match serde_json::from_str::<Value>(raw)
                .ok()
                .as_ref()
                .and_then(FileEntry::from_value)
            {
                Some(entry) => self.completed.push(entry),
                None => {
                    debug!(bytes = raw.len(), "closed object is not a file entry");
                    self.rejected += 1;
                }
            }
        }
    }

    pub fn completed(&self) -> &[FileEntry] {
        &self.completed
    }

    pub fn completed_paths(&self) -> Vec<String> {
        self.completed.iter().map(|e| e.path.clone()).collect()
    }

    pub fn into_completed(self) -> Vec<FileEntry> {
        self.completed
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected
    }

    /// The object still open at end of input, if any.
    pub fn partial(&self) -> Option<PartialObject> {
        if self.depth == 0 {
            return None;
        }
        let fragment = &self.buf[self.object_start?..];
        Some(PartialObject {
            path: extract_path(fragment),
            fragment: fragment.to_string(),
        })
    }
}

/// First `file_path`/`path` string value in `fragment`, unescaped.
pub fn extract_path(fragment: &str) -> Option<String> {
    let raw = PATH_KEY_RE.captures(fragment)?.get(1)?.as_str();
    serde_json::from_str::<String>(&format!("\"{}\"", raw))
        .ok()
        .or_else(|| Some(raw.to_string()))
}
