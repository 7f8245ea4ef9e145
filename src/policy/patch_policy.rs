//! Path authorization for agent-produced patches.
//!
//! Entries ending in `/` cover everything beneath them. Other entries match a
//! path exactly or as a `/`-joined ancestor (`docs` covers `docs/a.md` but not
//! `docs2/a.md`). Matching is case-sensitive and runs after separator
//! normalization and stripping of a leading `./`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    Protected { pattern: String },
    OutsideScope,
    /// Absolute, empty, or escaping the repository with `..`.
    UnsafePath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathViolation {
    pub path: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl fmt::Display for PathViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Protected { pattern } => {
                write!(f, "{}: protected path (matches '{}')", self.path, pattern)
            }
            ViolationKind::OutsideScope => write!(f, "{}: outside phase scope", self.path),
            ViolationKind::UnsafePath => write!(f, "{}: unsafe path", self.path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<PathViolation>,
    /// Each offending path once, in input order.
    pub blocked_files: Vec<String>,
}

impl ValidationResult {
    /// One violation per line, for feeding back to the agent.
    pub fn describe(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPolicy {
    protected: Vec<String>,
    allowed: Vec<String>,
    scope: Vec<String>,
}

impl PatchPolicy {
    pub fn new(protected: Vec<String>, allowed: Vec<String>, scope: Vec<String>) -> Self {
        let norm = |v: Vec<String>| -> Vec<String> {
            v.iter()
                .map(|e| normalize_path(e))
                .filter(|e| !e.is_empty())
                .collect()
        };
        Self {
            protected: norm(protected),
            allowed: norm(allowed),
            scope: norm(scope),
        }
    }

    pub fn protected(&self) -> &[String] {
        &self.protected
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Replace the scope, e.g. with a phase's own scope list.
    pub fn with_scope(mut self, scope: &[String]) -> Self {
        self.scope = scope
            .iter()
            .map(|e| normalize_path(e))
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    pub fn validate_paths<S: AsRef<str>>(&self, paths: &[S]) -> ValidationResult {
        let mut violations = Vec::new();
        let mut blocked_files: Vec<String> = Vec::new();

        for raw in paths {
            let path = normalize_path(raw.as_ref());
            let before = violations.len();

            if is_unsafe(&path) {
                violations.push(PathViolation {
                    path: path.clone(),
                    kind: ViolationKind::UnsafePath,
                });
            }

            if let Some(pattern) = self.protected.iter().find(|e| entry_matches(e, &path))
                && !self.allowed.iter().any(|e| entry_matches(e, &path))
            {
                violations.push(PathViolation {
                    path: path.clone(),
                    kind: ViolationKind::Protected {
                        pattern: pattern.clone(),
                    },
                });
            }

            if !self.scope.is_empty() && !self.scope.iter().any(|e| entry_matches(e, &path)) {
                violations.push(PathViolation {
                    path: path.clone(),
                    kind: ViolationKind::OutsideScope,
                });
            }

            if violations.len() > before && !blocked_files.contains(&path) {
                blocked_files.push(path);
            }
        }

        ValidationResult {
            valid: violations.is_empty(),
            violations,
            blocked_files,
        }
    }
}

/// Forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim().replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    p
}

fn entry_matches(entry: &str, path: &str) -> bool {
    if let Some(dir) = entry.strip_suffix('/') {
        path.starts_with(entry) || path == dir
    } else {
        path == entry
            || path
                .strip_prefix(entry)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

pub fn is_unsafe(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') {
        return true;
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return true;
    }
    path.split('/').any(|seg| seg == "..")
}
