use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::errors::RollbackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    SavepointCreated,
    RollbackStarted,
    CleanSkipped,
    Cleaned,
    Reset,
    RollbackFailed,
    SavepointDeleted,
    SavepointPruned,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SavepointCreated => "savepoint_created",
            AuditAction::RollbackStarted => "rollback_started",
            AuditAction::CleanSkipped => "clean_skipped",
            AuditAction::Cleaned => "cleaned",
            AuditAction::Reset => "reset",
            AuditAction::RollbackFailed => "rollback_failed",
            AuditAction::SavepointDeleted => "savepoint_deleted",
            AuditAction::SavepointPruned => "savepoint_pruned",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub phase_id: String,
    pub savepoint: String,
    pub reason: String,
}

impl AuditEntry {
    pub fn new(action: AuditAction, phase_id: &str, savepoint: &str, reason: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            phase_id: phase_id.to_string(),
            savepoint: savepoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// One tab-separated line. Newlines in the reason are flattened.
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\tphase={}\tsavepoint={}\treason={}",
            self.timestamp.to_rfc3339(),
            self.action.as_str(),
            self.phase_id,
            self.savepoint,
            self.reason.replace(['\n', '\r', '\t'], " ")
        )
    }
}

/// Append-only rollback log for one run.
#[derive(Debug, Clone)]
pub struct RollbackAuditLog {
    path: PathBuf,
}

impl RollbackAuditLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &AuditEntry) -> Result<(), RollbackError> {
        let wrap = |source| RollbackError::AuditWrite {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(wrap)?;
        writeln!(file, "{}", entry.to_line()).map_err(wrap)
    }

    pub fn lines(&self) -> Vec<String> {
        fs::read_to_string(&self.path)
            .map(|s| s.lines().map(String::from).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_appends_lines() {
        let dir = tempdir().unwrap();
        let log = RollbackAuditLog::new(&dir.path().join("runs/r1/rollback.log"));
        log.record(&AuditEntry::new(AuditAction::RollbackStarted, "p1", "tag-a", "apply failed"))
            .unwrap();
        log.record(&AuditEntry::new(AuditAction::Reset, "p1", "tag-a", "multi\nline"))
            .unwrap();

        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\trollback_started\tphase=p1\tsavepoint=tag-a\treason=apply failed"));
        assert!(lines[1].ends_with("reason=multi line"));
    }

    #[test]
    fn test_missing_log_has_no_lines() {
        let dir = tempdir().unwrap();
        let log = RollbackAuditLog::new(&dir.path().join("none.log"));
        assert!(log.lines().is_empty());
    }
}
