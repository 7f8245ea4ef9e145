//! Savepoints as git tags, and restoring the tree to one.
//!
//! Tag names have the form `ratchet-save--<run>--<phase>--<YYYYMMDDHHMMSSmmm>`.
//! Run and phase ids have every non-alphanumeric character replaced by `-`
//! with repeats collapsed, so `--` only ever separates fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use glob::Pattern;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::audit::{AuditAction, AuditEntry, RollbackAuditLog};
use super::git::{GitCli, GitInvokeError};
use crate::config::{RATCHET_DIR, SavepointConfig};
use crate::errors::RollbackError;

pub const TAG_PREFIX: &str = "ratchet-save--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    pub run_id: String,
    pub phase_id: String,
    pub created_at: DateTime<Utc>,
}

impl Savepoint {
    /// Parse a tag name produced by [`savepoint_name`].
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(TAG_PREFIX)?;
        let parts: Vec<&str> = rest.split("--").collect();
        let [run_id, phase_id, stamp] = parts.as_slice() else {
            return None;
        };
        Some(Self {
            name: name.to_string(),
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            created_at: parse_stamp(stamp)?,
        })
    }
}

/// Replace non-alphanumerics with `-`, collapse repeats, trim the ends.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn savepoint_name(run_id: &str, phase_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}--{}--{}",
        TAG_PREFIX,
        sanitize_component(run_id),
        sanitize_component(phase_id),
        at.format("%Y%m%d%H%M%S%3f")
    )
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    if stamp.len() != 17 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let num = |range: std::ops::Range<usize>| stamp[range].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(num(0..4)? as i32, num(4..6)?, num(6..8)?)?;
    let time = date.and_hms_milli_opt(num(8..10)?, num(10..12)?, num(12..14)?, num(14..17)?)?;
    Some(Utc.from_utc_datetime(&time))
}

#[derive(Debug, Clone)]
pub struct RollbackSettings {
    pub tag_timeout: Duration,
    pub reset_timeout: Duration,
    pub clean_timeout: Duration,
    /// Untracked files that a clean must never remove.
    pub protected_untracked: Vec<String>,
}

impl From<&SavepointConfig> for RollbackSettings {
    fn from(config: &SavepointConfig) -> Self {
        Self {
            tag_timeout: config.tag_timeout(),
            reset_timeout: config.reset_timeout(),
            clean_timeout: config.clean_timeout(),
            protected_untracked: config.protected_untracked.clone(),
        }
    }
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self::from(&SavepointConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub savepoint: String,
    /// Untracked paths that were removed.
    pub removed: Vec<String>,
    /// Protected untracked files that caused the clean to be skipped.
    pub clean_skipped_for: Vec<String>,
}

impl RollbackOutcome {
    pub fn clean_skipped(&self) -> bool {
        !self.clean_skipped_for.is_empty()
    }
}

pub struct RollbackManager {
    git: GitCli,
    run_id: String,
    settings: RollbackSettings,
    protected: Vec<ProtectedPattern>,
    audit: RollbackAuditLog,
}

impl RollbackManager {
    pub fn new(workdir: &Path, run_id: &str, settings: RollbackSettings, audit_log: &Path) -> Self {
        let protected = settings
            .protected_untracked
            .iter()
            .filter_map(|p| ProtectedPattern::new(p))
            .collect();
        Self {
            git: GitCli::new(workdir),
            run_id: run_id.to_string(),
            settings,
            protected,
            audit: RollbackAuditLog::new(audit_log),
        }
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    pub fn audit_log(&self) -> &RollbackAuditLog {
        &self.audit
    }

    /// Add `.ratchet/` to `.git/info/exclude` so engine files are never clean candidates.
    ///
    /// Returns true if the file was changed.
    pub fn ensure_engine_dir_excluded(&self) -> std::io::Result<bool> {
        let exclude = self.git.workdir().join(".git").join("info").join("exclude");
        let entry = format!("{}/", RATCHET_DIR);
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == entry || l.trim() == RATCHET_DIR) {
            return Ok(false);
        }
        if let Some(parent) = exclude.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&entry);
        content.push('\n');
        std::fs::write(&exclude, content)?;
        Ok(true)
    }

    /// Tag HEAD as a savepoint for `phase_id`.
    pub async fn create_savepoint(&self, phase_id: &str) -> Result<Savepoint, RollbackError> {
        let limit = self.settings.tag_timeout;
        let head = self
            .git
            .run(&["rev-parse", "--verify", "--quiet", "HEAD^{commit}"], limit)
            .await
            .map_err(|e| tag_error(e, limit))?;
        if !head.success() {
            return Err(RollbackError::NoHead);
        }

        let mut at = Utc::now();
        let mut name = savepoint_name(&self.run_id, phase_id, at);
        // Two savepoints of one phase inside the same millisecond.
        for _ in 0..5 {
            let existing = self
                .git
                .run(&["tag", "--list", &name], limit)
                .await
                .map_err(|e| tag_error(e, limit))?;
            if existing.stdout.trim().is_empty() {
                break;
            }
            at += chrono::Duration::milliseconds(1);
            name = savepoint_name(&self.run_id, phase_id, at);
        }

        let out = self
            .git
            .run(&["tag", &name, "HEAD"], limit)
            .await
            .map_err(|e| tag_error(e, limit))?;
        if !out.success() {
            return Err(RollbackError::TagFailed(out.message()));
        }

        info!(run_id = %self.run_id, phase_id, savepoint = %name, "savepoint created");
        self.audit.record(&AuditEntry::new(
            AuditAction::SavepointCreated,
            phase_id,
            &name,
            "before apply",
        ))?;

        Ok(Savepoint {
            name,
            run_id: sanitize_component(&self.run_id),
            phase_id: sanitize_component(phase_id),
            created_at: at,
        })
    }

    /// Restore tracked files to `savepoint` and remove untracked files.
    ///
    /// With `safe_clean` set, the clean is skipped when a protected file would
    /// go with it. The engine directory is never cleaned.
    pub async fn rollback_to_savepoint(
        &self,
        phase_id: &str,
        savepoint: &str,
        reason: &str,
        safe_clean: bool,
    ) -> Result<RollbackOutcome, RollbackError> {
        self.audit.record(&AuditEntry::new(
            AuditAction::RollbackStarted,
            phase_id,
            savepoint,
            reason,
        ))?;
        warn!(run_id = %self.run_id, phase_id, savepoint, reason, "rolling back");

        match self.restore(phase_id, savepoint, safe_clean).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let note = format!("{}: {}", err.code(), err);
                if let Err(audit_err) = self.audit.record(&AuditEntry::new(
                    AuditAction::RollbackFailed,
                    phase_id,
                    savepoint,
                    &note,
                )) {
                    warn!(error = %audit_err, "failed to record rollback failure");
                }
                Err(err)
            }
        }
    }

    async fn restore(
        &self,
        phase_id: &str,
        savepoint: &str,
        safe_clean: bool,
    ) -> Result<RollbackOutcome, RollbackError> {
        let mut outcome = RollbackOutcome {
            savepoint: savepoint.to_string(),
            ..RollbackOutcome::default()
        };

        let limit = self.settings.reset_timeout;
        let reset = self
            .git
            .run(&["reset", "--hard", savepoint], limit)
            .await
            .map_err(|e| match e {
                GitInvokeError::Spawn(io) => RollbackError::GitUnavailable(io),
                GitInvokeError::Timeout { .. } => RollbackError::ResetTimeout(limit),
            })?;
        if !reset.success() {
            return Err(RollbackError::ResetFailed {
                savepoint: savepoint.to_string(),
                message: reset.message(),
            });
        }
        self.audit.record(&AuditEntry::new(
            AuditAction::Reset,
            phase_id,
            savepoint,
            "tracked files restored",
        ))?;

        let candidates = self.clean_candidates().await?;
        let protected = if safe_clean {
            self.protected_among(&candidates)
        } else {
            Vec::new()
        };
        if !protected.is_empty() {
            warn!(
                phase_id,
                savepoint,
                protected = ?protected,
                "skipping untracked clean to keep protected files"
            );
            self.audit.record(&AuditEntry::new(
                AuditAction::CleanSkipped,
                phase_id,
                savepoint,
                &format!("protected untracked files: {}", protected.join(", ")),
            ))?;
            outcome.clean_skipped_for = protected;
            return Ok(outcome);
        }
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let limit = self.settings.clean_timeout;
        let keep = engine_dir_pattern();
        let clean = self
            .git
            .run(&["clean", "-f", "-d", "-e", &keep], limit)
            .await
            .map_err(|e| clean_error(e, limit))?;
        if !clean.success() {
            return Err(RollbackError::CleanFailed(clean.message()));
        }
        self.audit.record(&AuditEntry::new(
            AuditAction::Cleaned,
            phase_id,
            savepoint,
            &format!("removed {}", candidates.join(", ")),
        ))?;
        outcome.removed = candidates;
        Ok(outcome)
    }

    /// Paths `git clean -f -d` would remove.
    async fn clean_candidates(&self) -> Result<Vec<String>, RollbackError> {
        let limit = self.settings.clean_timeout;
        let keep = engine_dir_pattern();
        let dry = self
            .git
            .run(&["clean", "-n", "-d", "-e", &keep], limit)
            .await
            .map_err(|e| clean_error(e, limit))?;
        if !dry.success() {
            return Err(RollbackError::CleanFailed(dry.message()));
        }
        Ok(dry
            .stdout
            .lines()
            .filter_map(|l| l.strip_prefix("Would remove "))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect())
    }

    /// Protected files among the clean candidates, descending into directories.
    fn protected_among(&self, candidates: &[String]) -> Vec<String> {
        let root = self.git.workdir();
        let mut hits = Vec::new();
        for candidate in candidates {
            if candidate.ends_with('/') {
                let dir = root.join(candidate);
                if self.is_protected(candidate) {
                    hits.push(candidate.clone());
                    continue;
                }
                for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                    let Ok(rel) = entry.path().strip_prefix(root) else {
                        continue;
                    };
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if entry.file_type().is_file() && self.is_protected(&rel) {
                        hits.push(rel);
                    }
                }
            } else if self.is_protected(candidate) {
                hits.push(candidate.clone());
            }
        }
        hits
    }

    fn is_protected(&self, rel_path: &str) -> bool {
        self.protected.iter().any(|p| p.matches(rel_path))
    }

    /// Savepoints of this run (or of every run), oldest first.
    pub async fn list_savepoints(&self, all_runs: bool) -> Result<Vec<Savepoint>, RollbackError> {
        let pattern = if all_runs {
            format!("{}*", TAG_PREFIX)
        } else {
            format!("{}{}--*", TAG_PREFIX, sanitize_component(&self.run_id))
        };
        let limit = self.settings.tag_timeout;
        let out = self
            .git
            .run(&["tag", "--list", &pattern], limit)
            .await
            .map_err(list_error)?;
        if !out.success() {
            return Err(RollbackError::ListFailed(out.message()));
        }

        let mut savepoints = Vec::new();
        for name in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match Savepoint::parse(name) {
                Some(sp) => savepoints.push(sp),
                None => {
                    let Some(created_at) = self.commit_time(name).await? else {
                        warn!(tag = name, "ignoring unparseable savepoint tag");
                        continue;
                    };
                    savepoints.push(Savepoint {
                        name: name.to_string(),
                        run_id: String::new(),
                        phase_id: String::new(),
                        created_at,
                    });
                }
            }
        }
        savepoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(savepoints)
    }

    async fn commit_time(&self, tag: &str) -> Result<Option<DateTime<Utc>>, RollbackError> {
        let out = self
            .git
            .run(&["log", "-1", "--format=%ct", tag], self.settings.tag_timeout)
            .await
            .map_err(list_error)?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out
            .stdout
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
    }

    /// Delete this run's savepoints beyond the newest `keep_last`.
    pub async fn cleanup_savepoints(&self, keep_last: usize) -> Result<Vec<String>, RollbackError> {
        let savepoints = self.list_savepoints(false).await?;
        let excess = savepoints.len().saturating_sub(keep_last);
        let mut deleted = Vec::new();
        for sp in savepoints.into_iter().take(excess) {
            self.delete_tag(&sp.name).await?;
            self.audit.record(&AuditEntry::new(
                AuditAction::SavepointDeleted,
                &sp.phase_id,
                &sp.name,
                &format!("retention keep_last={}", keep_last),
            ))?;
            deleted.push(sp.name);
        }
        if !deleted.is_empty() {
            info!(run_id = %self.run_id, deleted = deleted.len(), "old savepoints deleted");
        }
        Ok(deleted)
    }

    /// Delete savepoints of any run created more than `max_age_days` ago.
    pub async fn prune_older_than(&self, max_age_days: u64) -> Result<Vec<String>, RollbackError> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let mut pruned = Vec::new();
        for sp in self.list_savepoints(true).await? {
            if sp.created_at >= cutoff {
                continue;
            }
            self.delete_tag(&sp.name).await?;
            self.audit.record(&AuditEntry::new(
                AuditAction::SavepointPruned,
                &sp.phase_id,
                &sp.name,
                &format!("older than {} days", max_age_days),
            ))?;
            pruned.push(sp.name);
        }
        Ok(pruned)
    }

    async fn delete_tag(&self, name: &str) -> Result<(), RollbackError> {
        let out = self
            .git
            .run(&["tag", "-d", name], self.settings.tag_timeout)
            .await
            .map_err(|e| RollbackError::DeleteFailed {
                savepoint: name.to_string(),
                message: e.to_string(),
            })?;
        if !out.success() {
            return Err(RollbackError::DeleteFailed {
                savepoint: name.to_string(),
                message: out.message(),
            });
        }
        Ok(())
    }
}

fn tag_error(err: GitInvokeError, limit: Duration) -> RollbackError {
    match err {
        GitInvokeError::Spawn(io) => RollbackError::GitUnavailable(io),
        GitInvokeError::Timeout { .. } => RollbackError::TagTimeout(limit),
    }
}

/// Extra exclude pattern keeping the engine directory out of `git clean`.
fn engine_dir_pattern() -> String {
    format!("/{}/", RATCHET_DIR)
}

fn clean_error(err: GitInvokeError, limit: Duration) -> RollbackError {
    match err {
        GitInvokeError::Spawn(io) => RollbackError::GitUnavailable(io),
        GitInvokeError::Timeout { .. } => RollbackError::CleanTimeout(limit),
    }
}

fn list_error(err: GitInvokeError) -> RollbackError {
    match err {
        GitInvokeError::Spawn(io) => RollbackError::GitUnavailable(io),
        timeout @ GitInvokeError::Timeout { .. } => RollbackError::ListFailed(timeout.to_string()),
    }
}

/// A protected-untracked entry.
///
/// `dir/` protects any path with a `dir` component. Patterns containing `/`
/// match the whole relative path; others match the file name.
#[derive(Debug, Clone)]
enum ProtectedPattern {
    Dir(String),
    Path(Pattern),
    Name(Pattern),
}

impl ProtectedPattern {
    fn new(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(dir) = raw.strip_suffix('/') {
            return Some(ProtectedPattern::Dir(dir.trim_start_matches("./").to_string()));
        }
        match Pattern::new(raw) {
            Ok(p) if raw.contains('/') => Some(ProtectedPattern::Path(p)),
            Ok(p) => Some(ProtectedPattern::Name(p)),
            Err(e) => {
                warn!(pattern = raw, error = %e, "ignoring invalid protected pattern");
                None
            }
        }
    }

    fn matches(&self, rel_path: &str) -> bool {
        let trimmed = rel_path.trim_end_matches('/');
        match self {
            ProtectedPattern::Dir(dir) => {
                let components: Vec<&str> = trimmed.split('/').collect();
                if dir.contains('/') {
                    trimmed == dir || trimmed.starts_with(&format!("{}/", dir))
                } else {
                    components.iter().any(|c| c == dir)
                }
            }
            ProtectedPattern::Path(p) => p.matches(trimmed),
            ProtectedPattern::Name(p) => {
                let name = PathBuf::from(trimmed)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                p.matches(&name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        dir
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    fn make_manager(dir: &Path) -> RollbackManager {
        RollbackManager::new(
            dir,
            "run-1",
            RollbackSettings::default(),
            &dir.join(".ratchet/runs/run-1/rollback.log"),
        )
    }

    #[test]
    fn test_savepoint_name_is_parseable() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap() + chrono::Duration::milliseconds(89);
        let name = savepoint_name("run 1/x", "phase_2.b", at);
        assert_eq!(name, "ratchet-save--run-1-x--phase-2-b--20260304050607089");
        let sp = Savepoint::parse(&name).unwrap();
        assert_eq!(sp.run_id, "run-1-x");
        assert_eq!(sp.phase_id, "phase-2-b");
        assert_eq!(sp.created_at, at);
    }

    #[test]
    fn test_sanitize_collapses_separators() {
        assert_eq!(sanitize_component("a--b__c"), "a-b-c");
        assert_eq!(sanitize_component("-x-"), "x");
        assert_eq!(sanitize_component("///"), "x");
        assert!(Savepoint::parse("ratchet-save--a--b").is_none());
        assert!(Savepoint::parse("other-tag").is_none());
    }

    #[test]
    fn test_protected_patterns() {
        let p = |s| ProtectedPattern::new(s).unwrap();
        assert!(p(".env").matches(".env"));
        assert!(p(".env").matches("sub/.env"));
        assert!(p(".env.*").matches(".env.local"));
        assert!(p("*.db").matches("data/app.db"));
        assert!(!p("*.db").matches("data/app.dbx"));
        assert!(p(".ratchet/").matches(".ratchet/runs/r1/state.json"));
        assert!(p(".vscode/").matches("nested/.vscode/"));
        assert!(p("config/local/").matches("config/local/a.toml"));
        assert!(!p("config/local/").matches("other/config/local/a.toml"));
    }

    #[tokio::test]
    async fn test_create_savepoint_without_head_fails() {
        let dir = setup_repo();
        let mgr = make_manager(dir.path());
        let err = mgr.create_savepoint("p1").await.unwrap_err();
        assert_eq!(err.code(), "no_head");
    }

    #[tokio::test]
    async fn test_rollback_restores_tracked_and_removes_untracked() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mgr = make_manager(dir.path());
        mgr.ensure_engine_dir_excluded().unwrap();

        let sp = mgr.create_savepoint("p1").await.unwrap();
        fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        fs::create_dir_all(dir.path().join("gen")).unwrap();
        fs::write(dir.path().join("gen/new.rs"), "fn x() {}").unwrap();

        let outcome = mgr
            .rollback_to_savepoint("p1", &sp.name, "apply failed", true)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\n");
        assert!(!dir.path().join("gen").exists());
        assert!(!outcome.clean_skipped());
        assert_eq!(outcome.removed, vec!["gen/".to_string()]);
        // engine dir survives the clean
        assert!(dir.path().join(".ratchet/runs/run-1/rollback.log").exists());

        let log = mgr.audit_log().lines();
        assert!(log.iter().any(|l| l.contains("\trollback_started\t")));
        assert!(log.iter().any(|l| l.contains("\treset\t")));
        assert!(log.iter().any(|l| l.contains("\tcleaned\t")));
    }

    #[tokio::test]
    async fn test_rollback_keeps_protected_untracked_files() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mgr = make_manager(dir.path());

        let sp = mgr.create_savepoint("p1").await.unwrap();
        fs::write(dir.path().join("a.txt"), "broken\n").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        fs::write(dir.path().join("tmp/local.db"), "db").unwrap();
        fs::write(dir.path().join("stray.txt"), "x").unwrap();

        let outcome = mgr
            .rollback_to_savepoint("p1", &sp.name, "validation failed", true)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\n");
        assert!(dir.path().join(".env").exists());
        assert!(dir.path().join("tmp/local.db").exists());
        assert!(outcome.clean_skipped());
        assert!(outcome.clean_skipped_for.contains(&".env".to_string()));
        assert!(outcome.clean_skipped_for.contains(&"tmp/local.db".to_string()));
        assert!(mgr.audit_log().lines().iter().any(|l| l.contains("\tclean_skipped\t")));
    }

    #[tokio::test]
    async fn test_rollback_without_safe_clean_removes_protected_untracked() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mgr = make_manager(dir.path());
        let sp = mgr.create_savepoint("p1").await.unwrap();
        fs::write(dir.path().join("stray.txt"), "x").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();

        let outcome = mgr
            .rollback_to_savepoint("p1", &sp.name, "r", false)
            .await
            .unwrap();
        assert!(!outcome.clean_skipped());
        assert!(!dir.path().join("stray.txt").exists());
        assert!(!dir.path().join(".env").exists());
        // the audit log under the engine directory survives the clean
        assert!(mgr.audit_log().lines().iter().any(|l| l.contains("\tcleaned\t")));
    }

    #[tokio::test]
    async fn test_rollback_to_missing_savepoint_is_restore_failure() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mgr = make_manager(dir.path());
        let err = mgr
            .rollback_to_savepoint("p1", "ratchet-save--nope--p1--20200101000000000", "r", true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "reset_failed");
        assert!(err.is_restore_failure());
        assert!(mgr.audit_log().lines().iter().any(|l| l.contains("\trollback_failed\t")));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mgr = make_manager(dir.path());
        let mut names = Vec::new();
        for i in 0..4 {
            names.push(mgr.create_savepoint(&format!("p{i}")).await.unwrap().name);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let deleted = mgr.cleanup_savepoints(2).await.unwrap();
        assert_eq!(deleted, names[..2].to_vec());
        let left: Vec<String> = mgr
            .list_savepoints(false)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(left, names[2..].to_vec());
    }

    #[tokio::test]
    async fn test_cleanup_only_touches_own_run() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mine = make_manager(dir.path());
        let other = RollbackManager::new(
            dir.path(),
            "run-1-b",
            RollbackSettings::default(),
            &dir.path().join("other.log"),
        );
        let theirs = other.create_savepoint("p1").await.unwrap();
        mine.create_savepoint("p1").await.unwrap();
        mine.cleanup_savepoints(0).await.unwrap();
        let all: Vec<String> = mine
            .list_savepoints(true)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(all, vec![theirs.name]);
    }

    #[tokio::test]
    async fn test_same_millisecond_savepoints_get_distinct_names() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mgr = make_manager(dir.path());
        let a = mgr.create_savepoint("p1").await.unwrap();
        let b = mgr.create_savepoint("p1").await.unwrap();
        assert_ne!(a.name, b.name);
    }

    #[tokio::test]
    async fn test_prune_by_age_across_runs() {
        let dir = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        let mgr = make_manager(dir.path());
        // an old savepoint from another run, tagged directly
        let old_at = Utc::now() - chrono::Duration::days(30);
        let old_name = savepoint_name("old-run", "p1", old_at);
        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.tag_lightweight(&old_name, head.as_object(), false).unwrap();
        let fresh = mgr.create_savepoint("p1").await.unwrap();

        let pruned = mgr.prune_older_than(7).await.unwrap();
        assert_eq!(pruned, vec![old_name]);
        let left: Vec<String> = mgr
            .list_savepoints(true)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(left, vec![fresh.name]);
    }

    #[test]
    fn test_exclude_entry_added_once() {
        let dir = setup_repo();
        let mgr = make_manager(dir.path());
        assert!(mgr.ensure_engine_dir_excluded().unwrap());
        assert!(!mgr.ensure_engine_dir_excluded().unwrap());
        let content = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert_eq!(content.matches(".ratchet/").count(), 1);
    }
}
