//! Patches built from recovered agent output, and applying them.

use std::path::Path;
use std::time::Duration;

use ratchet_common::OutputFormat;
use serde_json::Value;
use tracing::{debug, info};

use super::patch_policy::{is_unsafe, normalize_path};
use crate::errors::ApplyError;
use crate::recovery::{FileEntry, IncrementalParser, split_diff_sections};
use crate::rollback::{GitCli, GitInvokeError};
use crate::util::{sha256_hex, strip_code_fence};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    UnifiedDiff(String),
    /// Whole-file contents, written as-is.
    FullFiles(Vec<FileEntry>),
}

impl Patch {
    /// Build a patch from a complete (or fully merged) agent response.
    pub fn from_output(output: &str, format: OutputFormat) -> Result<Self, ApplyError> {
        let body = strip_code_fence(output);
        match format {
            OutputFormat::Diff => {
                let sections = split_diff_sections(body);
                if sections.is_empty() {
                    return Err(ApplyError::Malformed("no diff sections found".into()));
                }
                if let Some(bad) = sections.iter().find(|s| !s.complete) {
                    return Err(ApplyError::Malformed(format!(
                        "incomplete diff section for {}",
                        bad.target_path().unwrap_or("<unknown>")
                    )));
                }
                let text: String = sections.iter().map(|s| s.text.as_str()).collect();
                Ok(Patch::UnifiedDiff(text))
            }
            OutputFormat::FullFile => {
                let parser = IncrementalParser::parse(body);
                if let Some(partial) = parser.partial() {
                    return Err(ApplyError::Malformed(format!(
                        "unterminated file object for {}",
                        partial.path.as_deref().unwrap_or("<unknown>")
                    )));
                }
                let files = parser.into_completed();
                if files.is_empty() {
                    return Err(ApplyError::Malformed("no file objects found".into()));
                }
                Ok(Patch::FullFiles(files))
            }
            OutputFormat::Ndjson => {
                let mut files = Vec::new();
                for (n, line) in body.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                    let entry = serde_json::from_str::<Value>(line.trim())
                        .ok()
                        .as_ref()
                        .and_then(FileEntry::from_value)
                        .ok_or_else(|| {
                            ApplyError::Malformed(format!("line {} is not a file object", n + 1))
                        })?;
                    files.push(entry);
                }
                if files.is_empty() {
                    return Err(ApplyError::Malformed("no file objects found".into()));
                }
                Ok(Patch::FullFiles(files))
            }
        }
    }

    /// Every path the patch creates, modifies or deletes.
    pub fn target_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        let mut push = |p: &str| {
            let p = normalize_path(p);
            if !paths.contains(&p) {
                paths.push(p);
            }
        };
        match self {
            Patch::UnifiedDiff(text) => {
                for section in split_diff_sections(text) {
                    if let Some(old) = section.old_path.as_deref() {
                        push(old);
                    }
                    if let Some(new) = section.new_path.as_deref() {
                        push(new);
                    }
                }
            }
            Patch::FullFiles(files) => {
                for f in files {
                    push(&f.path);
                }
            }
        }
        paths
    }

    /// Stable content digest, used for idempotency keys.
    pub fn digest(&self) -> String {
        match self {
            Patch::UnifiedDiff(text) => sha256_hex(text.as_bytes()),
            Patch::FullFiles(files) => {
                let mut buf = Vec::new();
                for f in files {
                    buf.extend_from_slice(f.path.as_bytes());
                    buf.push(0);
                    buf.extend_from_slice(f.content.as_bytes());
                    buf.push(0);
                }
                sha256_hex(&buf)
            }
        }
    }

    /// Apply to the working tree. Paths must already have passed the policy.
    pub async fn apply(&self, git: &GitCli, limit: Duration) -> Result<Vec<String>, ApplyError> {
        match self {
            Patch::UnifiedDiff(text) => {
                apply_diff(git, text, limit).await?;
            }
            Patch::FullFiles(files) => {
                write_files(git.workdir(), files).await?;
            }
        }
        let paths = self.target_paths();
        info!(files = paths.len(), "patch applied");
        Ok(paths)
    }
}

async fn apply_diff(git: &GitCli, text: &str, limit: Duration) -> Result<(), ApplyError> {
    let map = |e: GitInvokeError| match e {
        GitInvokeError::Spawn(io) => ApplyError::GitUnavailable(io),
        GitInvokeError::Timeout { .. } => ApplyError::Timeout(limit),
    };

    let check = git
        .run_with_stdin(
            &["apply", "--check", "--whitespace=nowarn", "-"],
            Some(text.as_bytes()),
            limit,
        )
        .await
        .map_err(map)?;
    if !check.success() {
        return Err(ApplyError::Rejected(check.message()));
    }

    let applied = git
        .run_with_stdin(
            &["apply", "--whitespace=nowarn", "-"],
            Some(text.as_bytes()),
            limit,
        )
        .await
        .map_err(map)?;
    if !applied.success() {
        return Err(ApplyError::Rejected(applied.message()));
    }
    Ok(())
}

async fn write_files(root: &Path, files: &[FileEntry]) -> Result<(), ApplyError> {
    let canonical_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|source| ApplyError::Write {
            path: root.to_path_buf(),
            source,
        })?;
    for file in files {
        let rel = normalize_path(&file.path);
        if is_unsafe(&rel) {
            return Err(ApplyError::Rejected(format!("unsafe path {}", file.path)));
        }
        let path = root.join(&rel);
        if let Some(parent) = path.parent() {
            ensure_inside(&canonical_root, parent, &rel).await?;
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ApplyError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
            ensure_inside(&canonical_root, parent, &rel).await?;
        }
        if let Ok(meta) = tokio::fs::symlink_metadata(&path).await
            && meta.file_type().is_symlink()
        {
            return Err(ApplyError::Rejected(format!("{} is a symlink", rel)));
        }
        tokio::fs::write(&path, &file.content)
            .await
            .map_err(|source| ApplyError::Write {
                path: path.clone(),
                source,
            })?;
        debug!(path = %rel, bytes = file.content.len(), "file written");
    }
    Ok(())
}

/// Reject `dir` when its nearest existing ancestor resolves outside the root.
async fn ensure_inside(canonical_root: &Path, dir: &Path, rel: &str) -> Result<(), ApplyError> {
    let mut existing = dir;
    while tokio::fs::symlink_metadata(existing).await.is_err() {
        match existing.parent() {
            Some(up) => existing = up,
            None => break,
        }
    }
    let resolved = tokio::fs::canonicalize(existing)
        .await
        .map_err(|source| ApplyError::Write {
            path: existing.to_path_buf(),
            source,
        })?;
    if !resolved.starts_with(canonical_root) {
        return Err(ApplyError::Rejected(format!(
            "{} resolves outside the repository",
            rel
        )));
    }
    Ok(())
}
