//! Policy check, savepoint, apply, and rollback on failure, as one step.

use std::time::Duration;

use tracing::{info, warn};

use super::patch::Patch;
use super::patch_policy::{PatchPolicy, ValidationResult, normalize_path};
use crate::config::PolicyConfig;
use crate::errors::{ApplyError, RollbackError};
use crate::rollback::{RollbackManager, RollbackOutcome, Savepoint};

/// Protected entries that internal mode never removes.
pub const CRITICAL_PROTECTED: [&str; 2] = [".git/", ".ratchet/"];

/// Protected list for a run. Critical entries are always present; internal
/// mode keeps nothing else.
pub fn effective_protected(protected: &[String], internal_mode: bool) -> Vec<String> {
    let mut out: Vec<String> = CRITICAL_PROTECTED.iter().map(|s| s.to_string()).collect();
    if !internal_mode {
        for entry in protected {
            if !out.contains(entry) {
                out.push(entry.clone());
            }
        }
    }
    out
}

/// Allowed list for a run. Entries that would reopen a critical path are
/// dropped.
pub fn effective_allowed(allowed: &[String]) -> Vec<String> {
    allowed
        .iter()
        .filter(|entry| {
            let path = normalize_path(entry);
            let bare = path.trim_end_matches('/');
            let reopens = CRITICAL_PROTECTED.iter().any(|critical| {
                bare == critical.trim_end_matches('/') || path.starts_with(critical)
            });
            if reopens {
                warn!(entry = %entry, "ignoring allowed entry under a critical path");
            }
            !reopens
        })
        .cloned()
        .collect()
}

#[derive(Debug)]
pub enum ApplyOutcome {
    Applied {
        savepoint: Savepoint,
        files: Vec<String>,
    },
    /// Nothing was touched.
    PolicyRejected(ValidationResult),
    /// Tagging failed before the tree was modified.
    SavepointUnavailable(RollbackError),
    /// Apply failed and the tree was restored.
    RolledBack {
        error: ApplyError,
        rollback: RollbackOutcome,
    },
    /// Apply failed and restoring the tree failed too.
    RollbackFailed {
        error: ApplyError,
        rollback_error: RollbackError,
    },
}

#[derive(Debug, Clone)]
pub struct GovernedApplyPath {
    policy: PatchPolicy,
    apply_timeout: Duration,
    safe_clean: bool,
    /// Savepoints to keep after success; `None` disables cleanup.
    keep_last: Option<usize>,
}

impl GovernedApplyPath {
    pub fn new(policy: PatchPolicy) -> Self {
        Self {
            policy,
            apply_timeout: Duration::from_secs(60),
            safe_clean: true,
            keep_last: None,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        let protected = effective_protected(&config.protected, config.internal_mode);
        if config.internal_mode {
            info!(protected = ?protected, "internal mode: only critical paths protected");
        }
        Self::new(PatchPolicy::new(
            protected,
            effective_allowed(&config.allowed),
            config.scope.clone(),
        ))
        .with_apply_timeout(config.apply_timeout())
    }

    pub fn with_safe_clean(mut self, safe_clean: bool) -> Self {
        self.safe_clean = safe_clean;
        self
    }

    pub fn with_retention(mut self, keep_last: Option<usize>) -> Self {
        // the newest savepoint must survive for a post-apply rollback
        self.keep_last = keep_last.map(|n| n.max(1));
        self
    }

    pub fn with_apply_timeout(mut self, limit: Duration) -> Self {
        self.apply_timeout = limit;
        self
    }

    pub fn policy(&self) -> &PatchPolicy {
        &self.policy
    }

    /// Check `patch` against the policy, with `scope` narrowing it when non-empty.
    pub fn check(&self, patch: &Patch, scope: &[String]) -> ValidationResult {
        let paths = patch.target_paths();
        if scope.is_empty() {
            self.policy.validate_paths(&paths)
        } else {
            self.policy.clone().with_scope(scope).validate_paths(&paths)
        }
    }

    pub async fn apply_patch(
        &self,
        rollback: &RollbackManager,
        phase_id: &str,
        patch: &Patch,
        scope: &[String],
    ) -> ApplyOutcome {
        let verdict = self.check(patch, scope);
        if !verdict.valid {
            warn!(phase_id, blocked = ?verdict.blocked_files, "patch rejected by policy");
            return ApplyOutcome::PolicyRejected(verdict);
        }

        let savepoint = match rollback.create_savepoint(phase_id).await {
            Ok(sp) => sp,
            Err(e) => {
                warn!(phase_id, code = e.code(), error = %e, "savepoint unavailable, not applying");
                return ApplyOutcome::SavepointUnavailable(e);
            }
        };

        match patch.apply(rollback.git(), self.apply_timeout).await {
            Ok(files) => {
                if let Some(keep) = self.keep_last
                    && let Err(e) = rollback.cleanup_savepoints(keep).await
                {
                    warn!(phase_id, code = e.code(), error = %e, "savepoint cleanup failed");
                }
                ApplyOutcome::Applied { savepoint, files }
            }
            Err(error) => {
                warn!(phase_id, savepoint = %savepoint.name, error = %error, "apply failed, rolling back");
                let reason = format!("apply failed: {}", error);
                match rollback
                    .rollback_to_savepoint(phase_id, &savepoint.name, &reason, self.safe_clean)
                    .await
                {
                    Ok(outcome) => ApplyOutcome::RolledBack {
                        error,
                        rollback: outcome,
                    },
                    Err(rollback_error) => ApplyOutcome::RollbackFailed {
                        error,
                        rollback_error,
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::FileEntry;
    use crate::rollback::RollbackSettings;
    use git2::Repository;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("README.md"), "readme\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        dir
    }

    fn rollback_for(dir: &Path) -> RollbackManager {
        let mgr = RollbackManager::new(
            dir,
            "run-1",
            RollbackSettings::default(),
            &dir.join(".ratchet/runs/run-1/rollback.log"),
        );
        mgr.ensure_engine_dir_excluded().unwrap();
        mgr
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_internal_mode_keeps_only_critical_entries() {
        let configured = strings(&[".github/", "Cargo.lock"]);
        let normal = effective_protected(&configured, false);
        assert!(normal.contains(&".github/".to_string()));
        assert!(normal.contains(&".git/".to_string()));

        let internal = effective_protected(&configured, true);
        assert_eq!(internal, strings(&[".git/", ".ratchet/"]));
    }

    #[test]
    fn test_allowed_cannot_reopen_critical_paths() {
        let allowed = strings(&[".git/hooks/", ".ratchet", "./.git/config", "docs/"]);
        assert_eq!(effective_allowed(&allowed), strings(&["docs/"]));

        let governed = GovernedApplyPath::from_config(&PolicyConfig {
            protected: strings(&["docs/"]),
            allowed: allowed.clone(),
            ..PolicyConfig::default()
        });
        let hook = Patch::FullFiles(vec![FileEntry {
            path: ".git/hooks/pre-commit".into(),
            content: "#!/bin/sh\n".into(),
        }]);
        let verdict = governed.check(&hook, &[]);
        assert!(!verdict.valid);
        assert_eq!(verdict.blocked_files, vec![".git/hooks/pre-commit"]);

        let doc = Patch::FullFiles(vec![FileEntry {
            path: "docs/guide.md".into(),
            content: String::new(),
        }]);
        assert!(governed.check(&doc, &[]).valid);
    }

    #[test]
    fn test_apply_timeout_comes_from_config() {
        let governed = GovernedApplyPath::from_config(&PolicyConfig {
            apply_timeout_secs: 5,
            ..PolicyConfig::default()
        });
        assert_eq!(governed.apply_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_phase_scope_narrows_policy() {
        let governed = GovernedApplyPath::new(PatchPolicy::default());
        let patch = Patch::FullFiles(vec![FileEntry {
            path: "docs/a.md".into(),
            content: String::new(),
        }]);
        assert!(governed.check(&patch, &[]).valid);
        assert!(!governed.check(&patch, &strings(&["src/"])).valid);
    }

    #[tokio::test]
    async fn test_policy_rejection_touches_nothing() {
        let dir = setup_repo();
        let rollback = rollback_for(dir.path());
        let governed = GovernedApplyPath::from_config(&PolicyConfig {
            protected: strings(&["secrets/"]),
            ..PolicyConfig::default()
        });
        let patch = Patch::FullFiles(vec![
            FileEntry {
                path: "src/ok.rs".into(),
                content: "x".into(),
            },
            FileEntry {
                path: "secrets/key".into(),
                content: "y".into(),
            },
        ]);
        let outcome = governed.apply_patch(&rollback, "p1", &patch, &[]).await;
        let ApplyOutcome::PolicyRejected(result) = outcome else {
            panic!("Expected PolicyRejected, got {:?}", outcome);
        };
        assert_eq!(result.blocked_files, vec!["secrets/key"]);
        assert!(!dir.path().join("src/ok.rs").exists());
        assert!(rollback.list_savepoints(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_dir_is_always_protected() {
        let dir = setup_repo();
        let rollback = rollback_for(dir.path());
        let governed = GovernedApplyPath::from_config(&PolicyConfig {
            internal_mode: true,
            ..PolicyConfig::default()
        });
        let patch = Patch::FullFiles(vec![FileEntry {
            path: ".ratchet/ratchet.toml".into(),
            content: String::new(),
        }]);
        assert!(matches!(
            governed.apply_patch(&rollback, "p1", &patch, &[]).await,
            ApplyOutcome::PolicyRejected(_)
        ));
    }

    #[tokio::test]
    async fn test_successful_apply_keeps_savepoint() {
        let dir = setup_repo();
        let rollback = rollback_for(dir.path());
        let governed = GovernedApplyPath::new(PatchPolicy::default()).with_retention(Some(0));
        let patch = Patch::FullFiles(vec![FileEntry {
            path: "src/lib.rs".into(),
            content: "pub fn f() {}\n".into(),
        }]);
        let outcome = governed.apply_patch(&rollback, "p1", &patch, &[]).await;
        let ApplyOutcome::Applied { savepoint, files } = outcome else {
            panic!("Expected Applied, got {:?}", outcome);
        };
        assert_eq!(files, vec!["src/lib.rs"]);
        let left = rollback.list_savepoints(false).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, savepoint.name);
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back() {
        let dir = setup_repo();
        let rollback = rollback_for(dir.path());
        let governed = GovernedApplyPath::new(PatchPolicy::default());
        let diff = "\
--- /dev/null
+++ b/new.txt
@@ -0,0 +1 @@
+new
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-not what is there
+changed
";
        let patch = Patch::from_output(diff, ratchet_common::OutputFormat::Diff).unwrap();
        let outcome = governed.apply_patch(&rollback, "p1", &patch, &[]).await;
        let ApplyOutcome::RolledBack { error, .. } = outcome else {
            panic!("Expected RolledBack, got {:?}", outcome);
        };
        assert!(matches!(error, ApplyError::Rejected(_)));
        assert!(!dir.path().join("new.txt").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "readme\n"
        );
        assert!(
            rollback
                .audit_log()
                .lines()
                .iter()
                .any(|l| l.contains("\trollback_started\t"))
        );
    }

    #[tokio::test]
    async fn test_no_history_means_no_savepoint() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let rollback = rollback_for(dir.path());
        let governed = GovernedApplyPath::new(PatchPolicy::default());
        let patch = Patch::FullFiles(vec![FileEntry {
            path: "a".into(),
            content: "b".into(),
        }]);
        let outcome = governed.apply_patch(&rollback, "p1", &patch, &[]).await;
        assert!(matches!(outcome, ApplyOutcome::SavepointUnavailable(RollbackError::NoHead)));
        assert!(!dir.path().join("a").exists());
    }
}
