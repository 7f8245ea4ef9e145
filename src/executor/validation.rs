//! External validation (tests/CI) after a patch is applied.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ValidationConfig;
use crate::rollback::sanitize_component;
use crate::util::extract_json_object;

/// Argument that expands to the changed file paths.
pub const FILES_PLACEHOLDER: &str = "{files}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub phase_id: String,
    pub attempt: u32,
    /// Paths the applied patch touched.
    pub files: Vec<String>,
}

/// Machine-readable pass/fail/error counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: u64,
    pub failed: u64,
    pub errors: u64,
}

impl ValidationReport {
    /// Read counts from a report document. Accepts top-level counts or a
    /// `summary` object, and `error` as an alias for `errors`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let source = value
            .get("summary")
            .filter(|s| s.is_object())
            .unwrap_or(value);
        let count = |keys: &[&str]| -> Option<u64> {
            keys.iter().find_map(|k| source.get(*k).and_then(Value::as_u64))
        };
        let passed = count(&["passed"]);
        let failed = count(&["failed"]);
        let errors = count(&["errors", "error"]);
        if passed.is_none() && failed.is_none() && errors.is_none() {
            return None;
        }
        Some(Self {
            passed: passed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            errors: errors.unwrap_or(0),
        })
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub report: Option<ValidationReport>,
    pub log_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

impl ValidationOutcome {
    pub fn passed() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            timed_out: false,
            report: None,
            log_path: None,
            report_path: None,
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            ..Self::passed()
        }
    }

    /// One-line reason for a failed run.
    pub fn summary(&self) -> String {
        let mut s = if self.timed_out {
            "validation timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("validation exited with {}", code),
                None => "validation terminated by signal".to_string(),
            }
        };
        if let Some(r) = &self.report {
            s.push_str(&format!(
                " ({} passed, {} failed, {} errors)",
                r.passed, r.failed, r.errors
            ));
        }
        if let Some(log) = &self.log_path {
            s.push_str(&format!("; log: {}", log.display()));
        }
        s
    }
}

/// Abstraction over the test/CI runner for testability.
#[async_trait]
pub trait ValidationRunner: Send + Sync {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome>;
}

/// Runs the configured argv in the project root with a timeout.
///
/// Combined output goes to `<artifacts>/<phase>-attempt-<n>.log`; the report
/// file, when configured and written, is moved to
/// `<artifacts>/<phase>-attempt-<n>.report.json`.
pub struct CommandValidationRunner {
    workdir: PathBuf,
    config: ValidationConfig,
    artifacts_dir: PathBuf,
}

impl CommandValidationRunner {
    pub fn new(workdir: &Path, config: ValidationConfig, artifacts_dir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            config,
            artifacts_dir: artifacts_dir.to_path_buf(),
        }
    }

    fn artifact_stem(request: &ValidationRequest) -> String {
        format!(
            "{}-attempt-{}",
            sanitize_component(&request.phase_id),
            request.attempt
        )
    }

    fn expand_args(&self, files: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        for arg in self.config.command.iter().skip(1) {
            if arg == FILES_PLACEHOLDER {
                args.extend(files.iter().cloned());
            } else {
                args.push(arg.clone());
            }
        }
        args
    }

    fn report_source(&self) -> Option<PathBuf> {
        self.config.report_file.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.workdir.join(p)
            }
        })
    }

    async fn collect_report(&self, stem: &str) -> (Option<ValidationReport>, Option<PathBuf>) {
        let Some(source) = self.report_source() else {
            return (None, None);
        };
        let content = match tokio::fs::read_to_string(&source).await {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %source.display(), error = %e, "no validation report written");
                return (None, None);
            }
        };
        let dest = self.artifacts_dir.join(format!("{}.report.json", stem));
        if let Err(e) = tokio::fs::write(&dest, &content).await {
            warn!(path = %dest.display(), error = %e, "failed to persist validation report");
        }
        // keep the report out of the working tree so it is never committed
        if let Err(e) = tokio::fs::remove_file(&source).await {
            debug!(path = %source.display(), error = %e, "failed to remove validation report");
        }
        // some runners print a banner around the JSON document
        let report = serde_json::from_str::<Value>(&content)
            .ok()
            .or_else(|| {
                extract_json_object(&content).and_then(|json| serde_json::from_str(json).ok())
            })
            .as_ref()
            .and_then(ValidationReport::from_value);
        if report.is_none() {
            warn!(path = %dest.display(), "validation report has no pass/fail counts");
        }
        (report, Some(dest))
    }
}

#[async_trait]
impl ValidationRunner for CommandValidationRunner {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome> {
        let Some(program) = self.config.command.first() else {
            bail!("validation.command is empty");
        };
        tokio::fs::create_dir_all(&self.artifacts_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.artifacts_dir.display()))?;
        if let Some(stale) = self.report_source() {
            let _ = tokio::fs::remove_file(&stale).await;
        }

        let stem = Self::artifact_stem(request);
        let log_path = self.artifacts_dir.join(format!("{}.log", stem));
        let args = self.expand_args(&request.files);
        info!(
            phase_id = %request.phase_id,
            attempt = request.attempt,
            program = %program,
            "running validation"
        );

        let child = Command::new(program)
            .args(&args)
            .current_dir(&self.workdir)
            .env("RATCHET_PHASE", &request.phase_id)
            .env("RATCHET_ATTEMPT", request.attempt.to_string())
            .env("RATCHET_CHANGED_FILES", request.files.join("\n"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn validation command: {}", program))?;

        let limit = self.config.timeout();
        let (exit_code, timed_out, log) = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => {
                let output = result.context("Failed to wait for validation command")?;
                let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    log.push_str("\n--- stderr ---\n");
                    log.push_str(&stderr);
                }
                (output.status.code(), false, log)
            }
            Err(_) => (
                None,
                true,
                format!("validation timed out after {}s\n", limit.as_secs()),
            ),
        };

        let header = format!(
            "# phase={} attempt={} command={:?} files={}\n",
            request.phase_id,
            request.attempt,
            self.config.command,
            request.files.len()
        );
        tokio::fs::write(&log_path, format!("{}{}", header, log))
            .await
            .with_context(|| format!("Failed to write validation log {}", log_path.display()))?;

        let (report, report_path) = self.collect_report(&stem).await;
        let success = !timed_out
            && exit_code == Some(0)
            && report.as_ref().is_none_or(ValidationReport::is_clean);

        let outcome = ValidationOutcome {
            success,
            exit_code,
            timed_out,
            report,
            log_path: Some(log_path),
            report_path,
        };
        if success {
            info!(phase_id = %request.phase_id, "validation passed");
        } else {
            warn!(phase_id = %request.phase_id, summary = %outcome.summary(), "validation failed");
        }
        Ok(outcome)
    }
}

/// Wait at most `limit` for `runner`; a hung runner counts as a failed run.
pub async fn validate_with_timeout(
    runner: &dyn ValidationRunner,
    request: &ValidationRequest,
    limit: Duration,
) -> Result<ValidationOutcome> {
    match timeout(limit, runner.validate(request)).await {
        Ok(result) => result,
        Err(_) => Ok(ValidationOutcome {
            success: false,
            exit_code: None,
            timed_out: true,
            report: None,
            log_path: None,
            report_path: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn request() -> ValidationRequest {
        ValidationRequest {
            phase_id: "p1".into(),
            attempt: 0,
            files: vec!["src/a.rs".into(), "src/b.rs".into()],
        }
    }

    fn runner(dir: &Path, command: &[&str], report: Option<&str>, timeout_secs: u64) -> CommandValidationRunner {
        let config = ValidationConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            report_file: report.map(PathBuf::from),
            timeout_secs,
        };
        CommandValidationRunner::new(dir, config, &dir.join("artifacts"))
    }

    #[test]
    fn test_report_counts_top_level_and_summary() {
        let r = ValidationReport::from_value(&json!({"passed": 3, "failed": 1})).unwrap();
        assert_eq!(r, ValidationReport { passed: 3, failed: 1, errors: 0 });
        assert!(!r.is_clean());

        let r = ValidationReport::from_value(&json!({"summary": {"passed": 2, "error": 1}})).unwrap();
        assert_eq!(r.errors, 1);

        assert!(ValidationReport::from_value(&json!({"ok": true})).is_none());
    }

    #[test]
    fn test_files_placeholder_expands() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &["pytest", "-q", "{files}"], None, 5);
        assert_eq!(r.expand_args(&request().files), vec!["-q", "src/a.rs", "src/b.rs"]);
    }

    #[tokio::test]
    async fn test_passing_command_writes_log() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &["sh", "-c", "echo all good"], None, 10);
        let outcome = r.validate(&request()).await.unwrap();
        assert!(outcome.success);
        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("all good"));
        assert!(dir.path().join("artifacts/p1-attempt-0.log").exists());
    }

    #[tokio::test]
    async fn test_failing_command_keeps_artifacts() {
        let dir = tempdir().unwrap();
        let script = r#"echo '{"passed":1,"failed":2}' > report.json; echo boom >&2; exit 1"#;
        let r = runner(dir.path(), &["sh", "-c", script], Some("report.json"), 10);
        let outcome = r.validate(&request()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.report.unwrap().failed, 2);
        assert!(
            outcome
                .report_path
                .as_ref()
                .unwrap()
                .ends_with("p1-attempt-0.report.json")
        );
        assert!(!dir.path().join("report.json").exists());
        let log = std::fs::read_to_string(outcome.log_path.as_ref().unwrap()).unwrap();
        assert!(log.contains("boom"));
        assert!(outcome.summary().contains("2 failed"));
    }

    #[tokio::test]
    async fn test_zero_exit_with_failures_in_report_fails() {
        let dir = tempdir().unwrap();
        let script = r#"echo '{"passed":0,"errors":1}' > report.json"#;
        let r = runner(dir.path(), &["sh", "-c", script], Some("report.json"), 10);
        let outcome = r.validate(&request()).await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_report_wrapped_in_banner_is_read() {
        let dir = tempdir().unwrap();
        let script = r#"printf 'results:\n{"passed":3,"failed":0}\ndone\n' > report.json"#;
        let r = runner(dir.path(), &["sh", "-c", script], Some("report.json"), 10);
        let outcome = r.validate(&request()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.report.unwrap().passed, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failed_run() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &["sleep", "10"], None, 1);
        let outcome = r.validate(&request()).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.summary().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &["definitely-not-a-real-binary-xyz"], None, 5);
        assert!(r.validate(&request()).await.is_err());
    }
}
