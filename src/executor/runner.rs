//! The phase execution loop.
//!
//! Each attempt runs: agent request, continuation rounds while the response
//! is truncated, patch parsing, the governed apply (policy, savepoint,
//! apply), external validation, and a commit guarded by an idempotency key.
//! Outcomes are recorded in both the per-run state document and the shared
//! relational store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use ratchet_common::{FailureCode, OutputFormat, Phase, PhaseStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::agent::{AgentClient, AgentRequest, AgentResponse, build_phase_prompt};
use super::validation::{
    CommandValidationRunner, ValidationRequest, ValidationRunner, validate_with_timeout,
};
use crate::config::{EngineConfig, RunPaths};
use crate::errors::{EngineError, StateError};
use crate::features::{Feature, FeatureFlags};
use crate::phase::PhasesFile;
use crate::policy::{ApplyOutcome, GovernedApplyPath, Patch};
use crate::recovery::{build_continuation_prompt, detect_truncation_context_as, merge_outputs};
use crate::rollback::{GitInvokeError, RollbackManager, RollbackSettings, sanitize_component};
use crate::state::{
    DependencyState, ExecutorStateManager, PhaseStateManager, PhaseStore, SqlitePhaseStore,
    StateHandle,
};
use crate::util::truncate_chars;

/// Extra time a validation runner gets beyond its own configured timeout.
const VALIDATION_GRACE: Duration = Duration::from_secs(5);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Cap on the failure text fed back into the next attempt's prompt.
const FEEDBACK_CHARS: usize = 4000;

/// Progress snapshot stored on the running attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptCheckpoint {
    /// Fully recovered agent output.
    pub output: String,
    pub format: OutputFormat,
    /// Set once the patch has been applied behind this savepoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<FailureCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub phases: Vec<PhaseSummary>,
    /// Phases whose attempt was interrupted by a previous process.
    #[serde(default)]
    pub recovered: Vec<String>,
    /// Phases failed as stale in the relational store.
    #[serde(default)]
    pub stale: Vec<String>,
}

impl RunSummary {
    pub fn phase(&self, phase_id: &str) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    pub fn all_completed(&self) -> bool {
        self.phases.iter().all(|p| p.status.is_done())
    }

    pub fn failed(&self) -> Vec<&PhaseSummary> {
        self.phases
            .iter()
            .filter(|p| matches!(p.status, PhaseStatus::Failed | PhaseStatus::Blocked))
            .collect()
    }
}

/// Why an attempt ended early.
enum AttemptError {
    Failed { code: FailureCode, message: String },
    Engine(EngineError),
}

impl AttemptError {
    fn failed(code: FailureCode, message: impl Into<String>) -> Self {
        AttemptError::Failed {
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for AttemptError {
    fn from(e: EngineError) -> Self {
        AttemptError::Engine(e)
    }
}

impl From<StateError> for AttemptError {
    fn from(e: StateError) -> Self {
        AttemptError::Engine(EngineError::State(e))
    }
}

pub struct PhaseExecutor {
    run_id: String,
    config: EngineConfig,
    features: FeatureFlags,
    paths: RunPaths,
    state: StateHandle<ExecutorStateManager>,
    rows: StateHandle<PhaseStateManager>,
    rollback: RollbackManager,
    governed: GovernedApplyPath,
    agent: Arc<dyn AgentClient>,
    validator: Option<Arc<dyn ValidationRunner>>,
}

impl PhaseExecutor {
    /// Open the executor for `run_id` with the SQLite store named in `config`.
    pub fn open(
        project_dir: &Path,
        run_id: &str,
        config: EngineConfig,
        features: FeatureFlags,
        agent: Arc<dyn AgentClient>,
    ) -> Result<Self, EngineError> {
        let paths = RunPaths::new(project_dir, run_id);
        let store_path = paths.store_path(&config);
        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| EngineError::ArtifactWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = SqlitePhaseStore::open(&store_path, config.busy_timeout())
            .map_err(StateError::from)?;
        Self::open_with_store(project_dir, run_id, config, features, agent, Box::new(store))
    }

    pub fn open_with_store(
        project_dir: &Path,
        run_id: &str,
        config: EngineConfig,
        features: FeatureFlags,
        agent: Arc<dyn AgentClient>,
        store: Box<dyn PhaseStore>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Other)?;
        let paths = RunPaths::new(project_dir, run_id);
        paths.ensure_directories().map_err(EngineError::Other)?;

        let state = ExecutorStateManager::open(run_id, paths.state_file.clone())?;
        let rows = PhaseStateManager::new(run_id, store, config.retry_policy());

        let rollback = RollbackManager::new(
            project_dir,
            run_id,
            RollbackSettings::from(&config.savepoints),
            &paths.rollback_log,
        );
        match rollback.ensure_engine_dir_excluded() {
            Ok(true) => debug!("registered engine directory in .git/info/exclude"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "could not update .git/info/exclude"),
        }

        let governed = GovernedApplyPath::from_config(&config.policy)
            .with_safe_clean(features.is_enabled(Feature::SafeClean))
            .with_retention(
                features
                    .is_enabled(Feature::SavepointRetention)
                    .then_some(config.savepoints.keep_last),
            );

        let validator: Option<Arc<dyn ValidationRunner>> = if config.validation.command.is_empty() {
            None
        } else {
            Some(Arc::new(CommandValidationRunner::new(
                project_dir,
                config.validation.clone(),
                &paths.artifacts_dir,
            )))
        };

        info!(run_id, project = %project_dir.display(), "executor ready");
        Ok(Self {
            run_id: run_id.to_string(),
            config,
            features,
            paths,
            state: StateHandle::new(state),
            rows: StateHandle::new(rows),
            rollback,
            governed,
            agent,
            validator,
        })
    }

    /// Replace the validation runner (the configured command by default).
    pub fn with_validator(mut self, validator: Arc<dyn ValidationRunner>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn state(&self) -> &StateHandle<ExecutorStateManager> {
        &self.state
    }

    pub fn rows(&self) -> &StateHandle<PhaseStateManager> {
        &self.rows
    }

    pub fn rollback(&self) -> &RollbackManager {
        &self.rollback
    }

    /// Register the phases of `file`. Phases already known keep their state.
    pub async fn register(&self, file: &PhasesFile) -> Result<(), EngineError> {
        let phases = file.to_phases(&self.run_id, self.config.executor.default_max_attempts);
        self.state.call(move |s| s.register_phases(phases)).await?;
        Ok(())
    }

    /// Run every runnable phase until nothing more can progress.
    pub async fn run(&self) -> Result<RunSummary, EngineError> {
        if self.features.is_enabled(Feature::ExternalValidation) && self.validator.is_none() {
            return Err(EngineError::Validation(anyhow!(
                "external validation is enabled but no validation command is configured"
            )));
        }

        let recovered = self.recover_interrupted().await?;
        let stale = if self.features.is_enabled(Feature::StaleDetection) {
            let threshold = self.config.stale_after();
            self.rows.call(move |m| m.fail_stale(threshold)).await?
        } else {
            Vec::new()
        };
        match self
            .rollback
            .prune_older_than(self.config.savepoints.max_age_days)
            .await
        {
            Ok(pruned) if !pruned.is_empty() => info!(count = pruned.len(), "pruned old savepoints"),
            Ok(_) => {}
            Err(e) => warn!(code = e.code(), error = %e, "savepoint pruning failed"),
        }

        loop {
            let mut progressed = false;
            let order: Vec<String> = self
                .state
                .call(|s| Ok(s.phases().iter().map(|p| p.phase_id.clone()).collect()))
                .await?;

            for phase_id in order {
                let phase = self.snapshot(&phase_id).await?;
                if phase.status.is_terminal() {
                    continue;
                }
                let id = phase_id.clone();
                match self.state.call(move |s| s.dependency_state(&id)).await? {
                    DependencyState::Ready => {
                        self.run_phase(&phase_id).await?;
                        progressed = true;
                    }
                    DependencyState::Waiting(deps) => {
                        debug!(phase_id = %phase_id, waiting_on = ?deps, "phase waiting");
                    }
                    DependencyState::Broken(dep) => {
                        self.block(&phase_id, &dep).await?;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        let summary = self.summary(recovered, stale).await?;
        info!(
            run_id = %self.run_id,
            completed = summary.phases.iter().filter(|p| p.status.is_done()).count(),
            failed = summary.failed().len(),
            "run finished"
        );
        Ok(summary)
    }

    async fn snapshot(&self, phase_id: &str) -> Result<Phase, EngineError> {
        let id = phase_id.to_string();
        let phase = self
            .state
            .call(move |s| {
                s.phase(&id)
                    .cloned()
                    .ok_or_else(|| StateError::UnknownPhase(id.clone()))
            })
            .await?;
        Ok(phase)
    }

    async fn summary(&self, recovered: Vec<String>, stale: Vec<String>) -> Result<RunSummary, EngineError> {
        let phases = self
            .state
            .call(|s| {
                Ok(s.phases()
                    .into_iter()
                    .map(|p| PhaseSummary {
                        phase_id: p.phase_id.clone(),
                        status: p.status,
                        attempts: p.attempts.len(),
                        failure_code: match p.status {
                            PhaseStatus::Blocked => Some(FailureCode::DependencyFailed),
                            s if s.is_done() => None,
                            _ => p.last_failure_code(),
                        },
                        error: if p.status.is_done() {
                            None
                        } else {
                            p.last_error().map(str::to_string)
                        },
                    })
                    .collect())
            })
            .await?;
        Ok(RunSummary {
            run_id: self.run_id.clone(),
            phases,
            recovered,
            stale,
        })
    }

    async fn recover_interrupted(&self) -> Result<Vec<String>, EngineError> {
        let recovered = self.state.call(|s| s.recover_interrupted()).await?;
        for phase_id in &recovered {
            let phase = self.snapshot(phase_id).await?;
            self.record_failure(
                phase_id,
                "process stopped during attempt",
                FailureCode::Interrupted,
                phase.status == PhaseStatus::Failed,
            )
            .await?;
        }
        Ok(recovered)
    }

    async fn block(&self, phase_id: &str, dependency: &str) -> Result<(), EngineError> {
        let (id, dep) = (phase_id.to_string(), dependency.to_string());
        self.state.call(move |s| s.block_phase(&id, &dep)).await?;
        self.record_failure(
            phase_id,
            &format!("dependency {} did not complete", dependency),
            FailureCode::DependencyFailed,
            true,
        )
        .await
    }

    /// Write a failure to the relational row, reloading once on a conflict.
    async fn record_failure(
        &self,
        phase_id: &str,
        reason: &str,
        code: FailureCode,
        final_failure: bool,
    ) -> Result<(), EngineError> {
        let (id, reason) = (phase_id.to_string(), reason.to_string());
        self.rows
            .call(move |m| match m.mark_failed(&id, &reason, code, final_failure) {
                Err(e) if e.is_conflict() => {
                    m.load_or_create_default(&id)?;
                    m.mark_failed(&id, &reason, code, final_failure)
                }
                other => other,
            })
            .await?;
        Ok(())
    }

    async fn record_start(&self, phase_id: &str, attempt: u32) -> Result<(), EngineError> {
        let id = phase_id.to_string();
        self.rows
            .call(move |m| match m.mark_in_progress(&id, attempt) {
                Err(e) if e.is_conflict() => {
                    m.load_or_create_default(&id)?;
                    m.mark_in_progress(&id, attempt)
                }
                other => other,
            })
            .await?;
        Ok(())
    }

    async fn record_complete(&self, phase_id: &str) -> Result<(), EngineError> {
        let id = phase_id.to_string();
        self.rows
            .call(move |m| match m.mark_complete(&id) {
                Err(e) if e.is_conflict() => {
                    m.load_or_create_default(&id)?;
                    m.mark_complete(&id)
                }
                other => other,
            })
            .await?;
        Ok(())
    }

    /// Run attempts of one phase until it completes or can no longer retry.
    async fn run_phase(&self, phase_id: &str) -> Result<(), EngineError> {
        loop {
            let phase = self.snapshot(phase_id).await?;
            if phase.status.is_terminal() || !phase.can_retry() {
                return Ok(());
            }

            let resume = resumable_checkpoint(&phase);
            let previous_failure = phase
                .current_attempt()
                .filter(|a| a.failure_code != Some(FailureCode::Interrupted))
                .and_then(|a| a.error_message.as_deref())
            .map(|msg| truncate_chars(msg, FEEDBACK_CHARS));

            let id = phase_id.to_string();
            let attempt = self.state.call(move |s| s.start_phase(&id)).await?;
            self.record_start(phase_id, attempt).await?;
            info!(phase_id, attempt, name = %phase.name, "running phase attempt");

            match self
                .run_attempt(&phase, attempt, resume, previous_failure.as_deref())
                .await
            {
                Ok(()) => {
                    let id = phase_id.to_string();
                    self.state
                        .call(move |s| s.complete_phase(&id, true, None, None))
                        .await?;
                    self.record_complete(phase_id).await?;
                    return Ok(());
                }
                Err(AttemptError::Failed { code, message }) if code.is_fatal() => {
                    error!(phase_id, attempt, code = %code, message = %message, "fatal attempt failure");
                    let (id, msg) = (phase_id.to_string(), message.clone());
                    self.state
                        .call(move |s| s.fail_phase_permanently(&id, &msg, code))
                        .await?;
                    self.record_failure(phase_id, &message, code, true).await?;
                    return Ok(());
                }
                Err(AttemptError::Failed { code, message }) => {
                    let (id, msg) = (phase_id.to_string(), message.clone());
                    let status = self
                        .state
                        .call(move |s| s.complete_phase(&id, false, Some(&msg), Some(code)))
                        .await?;
                    let final_failure = status == PhaseStatus::Failed;
                    self.record_failure(phase_id, &message, code, final_failure)
                        .await?;
                    if final_failure {
                        return Ok(());
                    }
                }
                Err(AttemptError::Engine(e)) => {
                    // The attempt stays open; the next start treats it as interrupted.
                    error!(phase_id, attempt, error = %e, "attempt aborted");
                    return Err(e);
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        phase: &Phase,
        attempt: u32,
        resume: Option<AttemptCheckpoint>,
        previous_failure: Option<&str>,
    ) -> Result<(), AttemptError> {
        let phase_id = phase.phase_id.as_str();

        let output = match resume {
            Some(checkpoint) => {
                if let Some(savepoint) = checkpoint.savepoint.as_deref() {
                    if let Ok(patch) = Patch::from_output(&checkpoint.output, checkpoint.format) {
                        let key = format!("commit:{}:{}", phase_id, patch.digest());
                        if self.commit_recorded(phase_id, &key).await? {
                            info!(phase_id, attempt, "changes were committed before the interruption");
                            return Ok(());
                        }
                    }
                    // an interrupted attempt may have left its patch applied
                    self.restore(phase_id, savepoint, "resume after interruption")
                        .await?;
                }
                info!(phase_id, attempt, "reusing recovered output from checkpoint");
                checkpoint.output
            }
            None => self.request_output(phase, attempt, previous_failure).await?,
        };
        self.checkpoint(
            phase_id,
            AttemptCheckpoint {
                output: output.clone(),
                format: phase.output_format,
                savepoint: None,
            },
        )
        .await?;

        let patch = Patch::from_output(&output, phase.output_format)
            .map_err(|e| AttemptError::failed(FailureCode::MalformedOutput, e.to_string()))?;

        let (savepoint, files) = match self
            .governed
            .apply_patch(&self.rollback, phase_id, &patch, &phase.scope)
            .await
        {
            ApplyOutcome::Applied { savepoint, files } => (savepoint, files),
            ApplyOutcome::PolicyRejected(result) => {
                return Err(AttemptError::failed(
                    FailureCode::PolicyViolation,
                    format!("patch touches disallowed paths:\n{}", result.describe()),
                ));
            }
            ApplyOutcome::SavepointUnavailable(e) => {
                return Err(AttemptError::failed(
                    FailureCode::SavepointUnavailable,
                    format!("{} ({})", e, e.code()),
                ));
            }
            ApplyOutcome::RolledBack { error, .. } => {
                return Err(AttemptError::failed(FailureCode::ApplyFailed, error.to_string()));
            }
            ApplyOutcome::RollbackFailed {
                error,
                rollback_error,
            } => {
                return Err(AttemptError::failed(
                    FailureCode::RollbackFailed,
                    format!(
                        "apply failed ({}) and restoring the savepoint failed: {} ({})",
                        error,
                        rollback_error,
                        rollback_error.code()
                    ),
                ));
            }
        };
        self.checkpoint(
            phase_id,
            AttemptCheckpoint {
                output,
                format: phase.output_format,
                savepoint: Some(savepoint.name.clone()),
            },
        )
        .await?;

        if self.features.is_enabled(Feature::ExternalValidation)
            && let Some(validator) = &self.validator
        {
            let request = ValidationRequest {
                phase_id: phase_id.to_string(),
                attempt,
                files: files.clone(),
            };
            let limit = self.config.validation.timeout() + VALIDATION_GRACE;
            let failure = match validate_with_timeout(validator.as_ref(), &request, limit).await {
                Ok(outcome) if outcome.success => None,
                Ok(outcome) => Some(outcome.summary()),
                Err(e) => Some(format!("validation runner failed: {:#}", e)),
            };
            if let Some(reason) = failure {
                self.restore(phase_id, &savepoint.name, &reason).await?;
                return Err(AttemptError::failed(FailureCode::ValidationFailed, reason));
            }
        }

        if self.config.executor.commit_on_success && self.features.is_enabled(Feature::CommitOnSuccess) {
            if let Err(reason) = self.commit(phase, attempt, &patch).await? {
                self.restore(phase_id, &savepoint.name, &reason).await?;
                return Err(AttemptError::failed(FailureCode::ApplyFailed, reason));
            }
        }

        info!(phase_id, attempt, files = files.len(), savepoint = %savepoint.name, "phase attempt succeeded");
        Ok(())
    }

    /// Roll the tree back; a failed restore is fatal for the phase.
    async fn restore(&self, phase_id: &str, savepoint: &str, reason: &str) -> Result<(), AttemptError> {
        let safe_clean = self.features.is_enabled(Feature::SafeClean);
        match self
            .rollback
            .rollback_to_savepoint(phase_id, savepoint, reason, safe_clean)
            .await
        {
            Ok(outcome) => {
                if outcome.clean_skipped() {
                    warn!(phase_id, protected = ?outcome.clean_skipped_for, "untracked clean skipped during rollback");
                }
                Ok(())
            }
            Err(e) => Err(AttemptError::failed(
                FailureCode::RollbackFailed,
                format!("restoring {} failed: {} ({})", savepoint, e, e.code()),
            )),
        }
    }

    async fn checkpoint(&self, phase_id: &str, checkpoint: AttemptCheckpoint) -> Result<(), AttemptError> {
        let data = serde_json::to_value(&checkpoint)
            .map_err(|e| EngineError::Other(anyhow!("Failed to serialize checkpoint: {}", e)))?;
        let id = phase_id.to_string();
        self.state.call(move |s| s.save_checkpoint(&id, data)).await?;
        Ok(())
    }

    /// Ask the agent for the phase output, continuing while it is truncated.
    async fn request_output(
        &self,
        phase: &Phase,
        attempt: u32,
        previous_failure: Option<&str>,
    ) -> Result<String, AttemptError> {
        let prompt = build_phase_prompt(
            &phase.name,
            &phase.instructions,
            &phase.deliverables,
            phase.output_format,
            previous_failure,
        );
        let max_rounds = self.config.continuation.max_rounds;

        let mut round = 0;
        let mut response = self.ask(phase, attempt, round, &prompt).await?;
        let mut output = response.text.clone();
        let mut tokens_used = response.tokens_used;

        while response.stop_reason.is_truncation() {
            if !self.features.is_enabled(Feature::ContinuationRecovery) {
                return Err(AttemptError::failed(
                    FailureCode::TruncationExhausted,
                    "agent output was truncated and continuation recovery is disabled",
                ));
            }
            if round >= max_rounds {
                return Err(AttemptError::failed(
                    FailureCode::TruncationExhausted,
                    format!("agent output still truncated after {} continuation rounds", max_rounds),
                ));
            }
            let Some(context) = detect_truncation_context_as(
                phase.output_format,
                &output,
                &phase.deliverables,
                &response.stop_reason,
                tokens_used,
            ) else {
                break;
            };
            round += 1;
            info!(
                phase_id = %phase.phase_id,
                attempt,
                round,
                completed = context.completed_files.len(),
                remaining = context.remaining_deliverables.len(),
                partial = ?context.last_partial_file,
                "agent output truncated, requesting continuation"
            );
            let follow_up = build_continuation_prompt(&context, &prompt);
            response = self.ask(phase, attempt, round, &follow_up).await?;
            tokens_used += response.tokens_used;
            output = merge_outputs(&output, &response.text, phase.output_format);
        }
        Ok(output)
    }

    async fn ask(
        &self,
        phase: &Phase,
        attempt: u32,
        round: u32,
        prompt: &str,
    ) -> Result<AgentResponse, AttemptError> {
        let stem = format!(
            "{}-attempt-{}-round-{}",
            sanitize_component(&phase.phase_id),
            attempt,
            round
        );
        self.write_artifact(&format!("{}.prompt.md", stem), prompt).await?;

        let request = AgentRequest {
            run_id: self.run_id.clone(),
            phase_id: phase.phase_id.clone(),
            attempt,
            round,
            prompt: prompt.to_string(),
            format: phase.output_format,
        };
        let response = self.agent.complete(&request).await.map_err(|e| {
            warn!(phase_id = %phase.phase_id, attempt, round, error = %e, "agent request failed");
            AttemptError::failed(FailureCode::AgentError, format!("{:#}", e))
        })?;
        debug!(
            phase_id = %phase.phase_id,
            round,
            stop_reason = ?response.stop_reason,
            tokens = response.tokens_used,
            "agent responded"
        );
        self.write_artifact(&format!("{}.output.txt", stem), &response.text)
            .await?;
        Ok(response)
    }

    async fn write_artifact(&self, name: &str, content: &str) -> Result<(), EngineError> {
        let path = self.paths.artifacts_dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| EngineError::ArtifactWrite { path, source })
    }

    /// Commit the applied change once per patch.
    ///
    /// The inner `Err` is a commit failure the attempt should report.
    async fn commit(
        &self,
        phase: &Phase,
        attempt: u32,
        patch: &Patch,
    ) -> Result<Result<(), String>, AttemptError> {
        let key = format!("commit:{}:{}", phase.phase_id, patch.digest());
        if self.commit_recorded(&phase.phase_id, &key).await? {
            info!(phase_id = %phase.phase_id, "commit already recorded, skipping");
            return Ok(Ok(()));
        }
        let (id, k) = (phase.phase_id.clone(), key.clone());
        let claimed = self
            .state
            .call(move |s| s.register_idempotency_key(&id, &k))
            .await?;
        if !claimed {
            // an earlier attempt claimed the key but never recorded the commit;
            // a clean tree below means it did land
            warn!(
                phase_id = %phase.phase_id,
                key = %key,
                "commit key claimed without a recorded commit, reconciling"
            );
        }

        let message = format!(
            "ratchet: {} ({})\n\nrun {} attempt {}",
            phase.name, phase.phase_id, self.run_id, attempt
        );
        if let Err(reason) = self.git_commit(&message).await {
            if claimed {
                let (id, k) = (phase.phase_id.clone(), key);
                self.state
                    .call(move |s| s.release_idempotency_key(&id, &k))
                    .await?;
            }
            return Ok(Err(reason));
        }

        let (id, k) = (phase.phase_id.clone(), key);
        self.state.call(move |s| s.record_side_effect(&id, &k)).await?;
        Ok(Ok(()))
    }

    async fn commit_recorded(&self, phase_id: &str, key: &str) -> Result<bool, EngineError> {
        let (id, k) = (phase_id.to_string(), key.to_string());
        let recorded = self
            .state
            .call(move |s| Ok(s.has_committed_side_effect(&id, &k)))
            .await?;
        Ok(recorded)
    }

    async fn git_commit(&self, message: &str) -> Result<(), String> {
        let git = self.rollback.git();
        let describe = |e: GitInvokeError| format!("git unavailable during commit: {}", e);

        let status = git
            .run(&["status", "--porcelain"], COMMIT_TIMEOUT)
            .await
            .map_err(describe)?;
        if status.success() && status.stdout.trim().is_empty() {
            debug!("nothing to commit");
            return Ok(());
        }

        let add = git.run(&["add", "-A"], COMMIT_TIMEOUT).await.map_err(describe)?;
        if !add.success() {
            return Err(format!("git add failed: {}", add.message()));
        }

        let identity = git
            .run(&["config", "user.email"], COMMIT_TIMEOUT)
            .await
            .map_err(describe)?;
        let mut args: Vec<&str> = Vec::new();
        if !identity.success() || identity.stdout.trim().is_empty() {
            args.extend(["-c", "user.name=ratchet", "-c", "user.email=ratchet@localhost"]);
        }
        args.extend(["commit", "-q", "-m", message]);
        let commit = git.run(&args, COMMIT_TIMEOUT).await.map_err(describe)?;
        if !commit.success() {
            return Err(format!("git commit failed: {}", commit.message()));
        }
        info!("committed phase changes");
        Ok(())
    }
}

/// Checkpoint of an attempt the previous process was interrupted in.
fn resumable_checkpoint(phase: &Phase) -> Option<AttemptCheckpoint> {
    let last = phase.current_attempt()?;
    if last.failure_code != Some(FailureCode::Interrupted) {
        return None;
    }
    let value = last.checkpoint.as_ref()?;
    match serde_json::from_value::<AttemptCheckpoint>(value.clone()) {
        Ok(cp) if cp.format == phase.output_format => Some(cp),
        Ok(_) => None,
        Err(e) => {
            warn!(phase_id = %phase.phase_id, error = %e, "ignoring unreadable checkpoint");
            None
        }
    }
}
