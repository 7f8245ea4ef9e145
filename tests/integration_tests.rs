//! Integration tests for the phase executor
//!
//! These run whole phases against a real git repository with a scripted
//! agent and validator standing in for the external collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use git2::Repository;
use ratchet::config::RunPaths;
use ratchet::executor::{
    AgentRequest, AgentResponse, AttemptCheckpoint, ValidationOutcome, ValidationRequest,
};
use ratchet::state::ExecutorStateManager;
use ratchet::{
    AgentClient, EngineConfig, FailureCode, Feature, FeatureFlags, OutputFormat, PhaseExecutor,
    PhaseStatus, PhasesFile, ValidationRunner,
};
use tempfile::TempDir;

const RUN_ID: &str = "run-1";

// =============================================================================
// Doubles and fixtures
// =============================================================================

/// Replays canned responses in order and records every request.
#[derive(Default)]
struct ScriptedAgent {
    responses: Mutex<VecDeque<AgentResponse>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    fn new(responses: Vec<AgentResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn complete(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("agent script exhausted"))
    }
}

/// Returns the scripted verdicts in order and records what it was asked.
struct ScriptedValidator {
    verdicts: Mutex<VecDeque<bool>>,
    requests: Mutex<Vec<ValidationRequest>>,
}

impl ScriptedValidator {
    fn new(verdicts: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ValidationRunner for ScriptedValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        let pass = self.verdicts.lock().unwrap().pop_front().unwrap_or(true);
        Ok(if pass {
            ValidationOutcome::passed()
        } else {
            ValidationOutcome::failed(1)
        })
    }
}

/// A repository with one committed file.
fn create_temp_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();

    fs::write(dir.path().join("README.md"), "# project\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();
    dir
}

fn phases(json: &str) -> PhasesFile {
    PhasesFile::parse(json).unwrap()
}

fn single_phase(max_attempts: u32, format: &str, deliverables: &[&str]) -> PhasesFile {
    let deliverables: Vec<String> = deliverables.iter().map(|d| format!("\"{}\"", d)).collect();
    phases(&format!(
        r#"{{"phases":[{{
            "phase_id": "scaffold",
            "phase_number": 1,
            "name": "Scaffold",
            "instructions": "Create the crate layout",
            "deliverables": [{}],
            "max_attempts": {},
            "output_format": "{}"
        }}]}}"#,
        deliverables.join(","),
        max_attempts,
        format
    ))
}

fn lib_rs_output() -> String {
    r#"[{"file_path":"src/lib.rs","content":"pub fn answer() -> u32 {\n    42\n}\n"}]"#.to_string()
}

async fn executor(
    dir: &Path,
    config: EngineConfig,
    features: FeatureFlags,
    agent: Arc<ScriptedAgent>,
    file: &PhasesFile,
) -> PhaseExecutor {
    let exec = PhaseExecutor::open(dir, RUN_ID, config, features, agent).unwrap();
    exec.register(file).await.unwrap();
    exec
}

fn savepoint_tags(dir: &Path) -> Vec<String> {
    let repo = Repository::open(dir).unwrap();
    repo.tag_names(Some("ratchet-save--*"))
        .unwrap()
        .iter()
        .flatten()
        .map(str::to_string)
        .collect()
}

fn head_message(dir: &Path) -> String {
    let repo = Repository::open(dir).unwrap();
    let commit = repo.head().unwrap().peel_to_commit().unwrap();
    commit.message().unwrap_or_default().to_string()
}

// =============================================================================
// Successful runs
// =============================================================================

mod success {
    use super::*;

    #[tokio::test]
    async fn test_phase_applies_and_commits() {
        let dir = create_temp_repo();
        let agent = ScriptedAgent::new(vec![AgentResponse::complete(lib_rs_output())]);
        let file = single_phase(3, "full_file", &["src/lib.rs"]);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            FeatureFlags::default(),
            agent.clone(),
            &file,
        )
        .await;

        let summary = exec.run().await.unwrap();
        assert!(summary.all_completed());
        let phase = summary.phase("scaffold").unwrap();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert_eq!(phase.attempts, 1);

        assert!(
            fs::read_to_string(dir.path().join("src/lib.rs"))
                .unwrap()
                .contains("42")
        );
        assert!(head_message(dir.path()).starts_with("ratchet: Scaffold (scaffold)"));
        assert_eq!(savepoint_tags(dir.path()).len(), 1);

        let repo = Repository::open(dir.path()).unwrap();
        let statuses = repo.statuses(None).unwrap();
        assert_eq!(statuses.len(), 0, "tree should be clean after commit");

        let row = exec
            .rows()
            .lock_sync()
            .unwrap()
            .get_phase_row("scaffold")
            .unwrap();
        assert_eq!(row.state, PhaseStatus::Completed);

        assert_eq!(agent.requests().len(), 1);
        assert!(
            exec.paths()
                .artifacts_dir
                .join("scaffold-attempt-0-round-0.prompt.md")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_commit_can_be_disabled() {
        let dir = create_temp_repo();
        let agent = ScriptedAgent::new(vec![AgentResponse::complete(lib_rs_output())]);
        let mut features = FeatureFlags::default();
        features.set_override(Feature::CommitOnSuccess, false);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            features,
            agent,
            &single_phase(1, "full_file", &[]),
        )
        .await;

        let summary = exec.run().await.unwrap();
        assert!(summary.all_completed());
        assert_eq!(head_message(dir.path()), "init");
        assert!(dir.path().join("src/lib.rs").exists());
    }

    #[tokio::test]
    async fn test_truncated_diff_is_continued_and_merged() {
        let dir = create_temp_repo();
        let partial = "\
--- /dev/null
+++ b/src/a.py
@@ -0,0 +1 @@
+a = 1
--- /dev/null
+++ b/src/b.py
@@ -0,0 +1 @@
+b = 2
--- /dev/null
+++ b/src/c.py
@@ -0,0 +1,2 @@
+def f():
";
        let continuation = "\
--- /dev/null
+++ b/src/c.py
@@ -0,0 +1,2 @@
+def f():
+    return 3
";
        let agent = ScriptedAgent::new(vec![
            AgentResponse::truncated(partial, 4096),
            AgentResponse::complete(continuation),
        ]);
        let file = single_phase(1, "diff", &["src/a.py", "src/b.py", "src/c.py"]);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            FeatureFlags::default(),
            agent.clone(),
            &file,
        )
        .await;

        let summary = exec.run().await.unwrap();
        assert_eq!(summary.phase("scaffold").unwrap().status, PhaseStatus::Completed);

        let requests = agent.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].round, 1);
        assert!(requests[1].prompt.contains("do not regenerate"));
        assert!(requests[1].prompt.contains("src/c.py"));

        assert_eq!(fs::read_to_string(dir.path().join("src/a.py")).unwrap(), "a = 1\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("src/c.py")).unwrap(),
            "def f():\n    return 3\n"
        );
    }
}

// =============================================================================
// Failed attempts
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_policy_violation_leaves_tree_untouched() {
        let dir = create_temp_repo();
        let output = r#"[{"file_path":"src/ok.rs","content":"x"},{"file_path":"secrets/key","content":"y"}]"#;
        let agent = ScriptedAgent::new(vec![AgentResponse::complete(output)]);
        let mut config = EngineConfig::default();
        config.policy.protected = vec!["secrets/".into()];
        let exec = executor(
            dir.path(),
            config,
            FeatureFlags::default(),
            agent,
            &single_phase(1, "full_file", &[]),
        )
        .await;

        let summary = exec.run().await.unwrap();
        let phase = summary.phase("scaffold").unwrap();
        assert_eq!(phase.status, PhaseStatus::Failed);
        assert_eq!(phase.failure_code, Some(FailureCode::PolicyViolation));
        assert!(phase.error.as_deref().unwrap().contains("secrets/key"));
        assert!(!dir.path().join("src/ok.rs").exists());
        assert!(savepoint_tags(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_rolls_back_then_retry_succeeds() {
        let dir = create_temp_repo();
        let agent = ScriptedAgent::new(vec![
            AgentResponse::complete(lib_rs_output()),
            AgentResponse::complete(lib_rs_output()),
        ]);
        let validator = ScriptedValidator::new(vec![false, true]);
        let mut features = FeatureFlags::default();
        features.set_override(Feature::ExternalValidation, true);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            features,
            agent.clone(),
            &single_phase(2, "full_file", &["src/lib.rs"]),
        )
        .await
        .with_validator(validator.clone());

        let summary = exec.run().await.unwrap();
        let phase = summary.phase("scaffold").unwrap();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert_eq!(phase.attempts, 2);

        let requests = agent.requests();
        assert!(requests[1].prompt.contains("Previous attempt failed"));
        assert_eq!(validator.requests.lock().unwrap().len(), 2);

        let audit = exec.rollback().audit_log().lines();
        assert!(audit.iter().any(|l| l.contains("\trollback_started\t")));
        assert!(head_message(dir.path()).contains("attempt 1"));

        let state = exec.state().lock_sync().unwrap();
        let recorded = state.phase("scaffold").unwrap();
        assert_eq!(
            recorded.attempts[0].failure_code,
            Some(FailureCode::ValidationFailed)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_commit_is_retried_and_lands() {
        use std::os::unix::fs::PermissionsExt;

        let dir = create_temp_repo();
        // rejects the first commit only
        let hook = dir.path().join(".git/hooks/pre-commit");
        fs::create_dir_all(hook.parent().unwrap()).unwrap();
        fs::write(
            &hook,
            "#!/bin/sh\nif [ ! -f .git/hook-ran ]; then touch .git/hook-ran; exit 1; fi\nexit 0\n",
        )
        .unwrap();
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

        let agent = ScriptedAgent::new(vec![
            AgentResponse::complete(lib_rs_output()),
            AgentResponse::complete(lib_rs_output()),
        ]);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            FeatureFlags::default(),
            agent,
            &single_phase(2, "full_file", &["src/lib.rs"]),
        )
        .await;

        let summary = exec.run().await.unwrap();
        let phase = summary.phase("scaffold").unwrap();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert_eq!(phase.attempts, 2);
        assert!(head_message(dir.path()).starts_with("ratchet: Scaffold (scaffold)"));

        let repo = Repository::open(dir.path()).unwrap();
        assert_eq!(repo.statuses(None).unwrap().len(), 0);
        let head = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(head.get_path(Path::new("src/lib.rs")).is_ok());

        let state = exec.state().lock_sync().unwrap();
        let recorded = state.phase("scaffold").unwrap();
        assert_eq!(recorded.attempts[0].failure_code, Some(FailureCode::ApplyFailed));
        assert!(recorded.attempts[0].idempotency_keys.is_empty());
        assert_eq!(recorded.side_effects_committed.len(), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_two_fails_twice() {
        let dir = create_temp_repo();
        let agent = ScriptedAgent::new(vec![
            AgentResponse::complete("I could not produce a diff."),
            AgentResponse::complete("Still no diff."),
        ]);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            FeatureFlags::default(),
            agent.clone(),
            &single_phase(2, "diff", &[]),
        )
        .await;

        let summary = exec.run().await.unwrap();
        let phase = summary.phase("scaffold").unwrap();
        assert_eq!(phase.status, PhaseStatus::Failed);
        assert_eq!(phase.attempts, 2);
        assert_eq!(phase.failure_code, Some(FailureCode::MalformedOutput));
        assert_eq!(agent.requests().len(), 2);

        let state = exec.state().lock_sync().unwrap();
        let recorded = state.phase("scaffold").unwrap();
        assert!(!recorded.can_retry());
        drop(state);

        let row = exec
            .rows()
            .lock_sync()
            .unwrap()
            .get_phase_row("scaffold")
            .unwrap();
        assert_eq!(row.state, PhaseStatus::Failed);
        assert_eq!(row.retry_attempt, 2);
        assert_eq!(row.last_failure_code, Some(FailureCode::MalformedOutput));
    }

    #[tokio::test]
    async fn test_truncation_beyond_round_limit_fails() {
        let dir = create_temp_repo();
        let cut = "--- /dev/null\n+++ b/src/a.py\n@@ -0,0 +1,3 @@\n+x\n";
        let agent = ScriptedAgent::new(vec![
            AgentResponse::truncated(cut, 10),
            AgentResponse::truncated(cut, 10),
        ]);
        let mut config = EngineConfig::default();
        config.continuation.max_rounds = 1;
        let exec = executor(
            dir.path(),
            config,
            FeatureFlags::default(),
            agent.clone(),
            &single_phase(1, "diff", &["src/a.py"]),
        )
        .await;

        let summary = exec.run().await.unwrap();
        let phase = summary.phase("scaffold").unwrap();
        assert_eq!(phase.failure_code, Some(FailureCode::TruncationExhausted));
        assert_eq!(agent.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent() {
        let dir = create_temp_repo();
        let agent = ScriptedAgent::new(vec![AgentResponse::complete("not a diff")]);
        let file = phases(
            r#"{"phases":[
                {"phase_id":"api","phase_number":2,"name":"API","dependencies":["base"]},
                {"phase_id":"base","phase_number":1,"name":"Base","max_attempts":1}
            ]}"#,
        );
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            FeatureFlags::default(),
            agent.clone(),
            &file,
        )
        .await;

        let summary = exec.run().await.unwrap();
        assert_eq!(summary.phase("base").unwrap().status, PhaseStatus::Failed);
        let api = summary.phase("api").unwrap();
        assert_eq!(api.status, PhaseStatus::Blocked);
        assert_eq!(api.failure_code, Some(FailureCode::DependencyFailed));
        assert_eq!(api.attempts, 0);
        assert_eq!(agent.requests().len(), 1);
    }
}

// =============================================================================
// Crash recovery
// =============================================================================

mod recovery {
    use super::*;

    #[tokio::test]
    async fn test_interrupted_attempt_resumes_from_checkpoint() {
        let dir = create_temp_repo();
        let file = single_phase(3, "full_file", &["src/lib.rs"]);

        // A previous process recovered the output, then died before applying it.
        {
            let paths = RunPaths::new(dir.path(), RUN_ID);
            let mut state = ExecutorStateManager::open(RUN_ID, paths.state_file.clone()).unwrap();
            state.register_phases(file.to_phases(RUN_ID, 3)).unwrap();
            state.start_phase("scaffold").unwrap();
            let checkpoint = AttemptCheckpoint {
                output: lib_rs_output(),
                format: OutputFormat::FullFile,
                savepoint: None,
            };
            state
                .save_checkpoint("scaffold", serde_json::to_value(&checkpoint).unwrap())
                .unwrap();
        }

        let agent = ScriptedAgent::new(vec![]);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            FeatureFlags::default(),
            agent.clone(),
            &file,
        )
        .await;

        let summary = exec.run().await.unwrap();
        assert_eq!(summary.recovered, vec!["scaffold"]);
        let phase = summary.phase("scaffold").unwrap();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert_eq!(phase.attempts, 2);
        assert!(agent.requests().is_empty(), "checkpointed output must be reused");
        assert!(dir.path().join("src/lib.rs").exists());

        let state = exec.state().lock_sync().unwrap();
        let recorded = state.phase("scaffold").unwrap();
        assert_eq!(recorded.attempts[0].failure_code, Some(FailureCode::Interrupted));
    }

    #[tokio::test]
    async fn test_completed_phase_is_not_rerun() {
        let dir = create_temp_repo();
        let file = single_phase(3, "full_file", &["src/lib.rs"]);
        let first = ScriptedAgent::new(vec![AgentResponse::complete(lib_rs_output())]);
        {
            let exec = executor(
                dir.path(),
                EngineConfig::default(),
                FeatureFlags::default(),
                first,
                &file,
            )
            .await;
            assert!(exec.run().await.unwrap().all_completed());
        }

        let second = ScriptedAgent::new(vec![]);
        let exec = executor(
            dir.path(),
            EngineConfig::default(),
            FeatureFlags::default(),
            second.clone(),
            &file,
        )
        .await;
        let summary = exec.run().await.unwrap();
        assert!(summary.all_completed());
        assert_eq!(summary.phase("scaffold").unwrap().attempts, 1);
        assert!(second.requests().is_empty());
    }
}
