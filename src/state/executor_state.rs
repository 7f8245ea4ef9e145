//! Durable phase/attempt bookkeeping for one run.
//!
//! The full state is one JSON document per run. Every save moves the
//! previous document to a `.bak` sibling before the new one is renamed into
//! place, so a torn or corrupt primary falls back to the last good backup
//! on load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ratchet_common::{Attempt, FailureCode, Phase, PhaseStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::StateError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    run_id: String,
    updated_at: DateTime<Utc>,
    phases: Vec<Phase>,
}

/// Whether a phase's dependencies allow it to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    Ready,
    /// Some dependency has not completed yet.
    Waiting(Vec<String>),
    /// A dependency failed or is blocked; this phase never can run.
    Broken(String),
}

pub struct ExecutorStateManager {
    run_id: String,
    state_file: PathBuf,
    phases: BTreeMap<String, Phase>,
}

impl ExecutorStateManager {
    /// Open the state for `run_id`, loading any previously persisted document.
    pub fn open(run_id: &str, state_file: PathBuf) -> Result<Self, StateError> {
        let mut manager = Self {
            run_id: run_id.to_string(),
            state_file,
            phases: BTreeMap::new(),
        };
        if let Some(doc) = manager.read_with_fallback()? {
            if doc.run_id != run_id {
                warn!(expected = run_id, found = %doc.run_id, "state file belongs to another run");
            }
            manager.phases = doc
                .phases
                .into_iter()
                .map(|p| (p.phase_id.clone(), p))
                .collect();
            info!(run_id, phases = manager.phases.len(), "loaded executor state");
        }
        Ok(manager)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn backup_file(&self) -> PathBuf {
        backup_path(&self.state_file)
    }

    /// Add phase definitions. Phases already known keep their recorded state.
    pub fn register_phases(&mut self, definitions: Vec<Phase>) -> Result<(), StateError> {
        let known: Vec<String> = definitions
            .iter()
            .map(|p| p.phase_id.clone())
            .chain(self.phases.keys().cloned())
            .collect();
        for def in &definitions {
            for dep in &def.dependencies {
                if dep == &def.phase_id || !known.contains(dep) {
                    return Err(StateError::UnknownDependency {
                        phase: def.phase_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for mut def in definitions {
            if self.phases.contains_key(&def.phase_id) {
                continue;
            }
            def.run_id = self.run_id.clone();
            self.phases.insert(def.phase_id.clone(), def);
        }
        self.save()
    }

    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.get(phase_id)
    }

    /// All phases ordered by phase number.
    pub fn phases(&self) -> Vec<&Phase> {
        let mut phases: Vec<&Phase> = self.phases.values().collect();
        phases.sort_by_key(|p| (p.phase_number, p.phase_id.clone()));
        phases
    }

    fn phase_mut(&mut self, phase_id: &str) -> Result<&mut Phase, StateError> {
        self.phases
            .get_mut(phase_id)
            .ok_or_else(|| StateError::UnknownPhase(phase_id.to_string()))
    }

    pub fn dependency_state(&self, phase_id: &str) -> Result<DependencyState, StateError> {
        let phase = self
            .phases
            .get(phase_id)
            .ok_or_else(|| StateError::UnknownPhase(phase_id.to_string()))?;
        let mut waiting = Vec::new();
        for dep in &phase.dependencies {
            match self.phases.get(dep).map(|d| d.status) {
                Some(PhaseStatus::Completed) | Some(PhaseStatus::Skipped) => {}
                Some(PhaseStatus::Failed) | Some(PhaseStatus::Blocked) | None => {
                    return Ok(DependencyState::Broken(dep.clone()));
                }
                Some(_) => waiting.push(dep.clone()),
            }
        }
        if waiting.is_empty() {
            Ok(DependencyState::Ready)
        } else {
            Ok(DependencyState::Waiting(waiting))
        }
    }

    /// Open a new attempt and move the phase to InProgress.
    pub fn start_phase(&mut self, phase_id: &str) -> Result<u32, StateError> {
        let phase = self.phase_mut(phase_id)?;
        if phase.status.is_terminal() {
            return Err(StateError::PhaseTerminal {
                phase_id: phase_id.to_string(),
                status: phase.status.to_string(),
            });
        }
        if !phase.can_retry() {
            return Err(StateError::AttemptsExhausted {
                phase_id: phase_id.to_string(),
                max_attempts: phase.max_attempts,
            });
        }
        if let Some(open) = phase.active_attempt_mut() {
            // Only reachable if a caller skipped complete_phase.
            open.finish(false, Some("superseded by a new attempt".into()), Some(FailureCode::Interrupted));
        }
        let number = phase.next_attempt_number();
        phase.attempts.push(Attempt::new(number));
        phase.status = PhaseStatus::InProgress;
        info!(phase_id, attempt = number, "attempt started");
        self.save()?;
        Ok(number)
    }

    /// Close the running attempt.
    ///
    /// Success completes the phase. Failure returns it to Pending while
    /// attempts remain, otherwise it becomes Failed.
    pub fn complete_phase(
        &mut self,
        phase_id: &str,
        success: bool,
        error_message: Option<&str>,
        code: Option<FailureCode>,
    ) -> Result<PhaseStatus, StateError> {
        let phase = self.phase_mut(phase_id)?;
        let attempt = phase
            .active_attempt_mut()
            .ok_or_else(|| StateError::NoActiveAttempt(phase_id.to_string()))?;
        attempt.finish(success, error_message.map(str::to_string), code);
        let attempt_number = attempt.attempt_number;

        phase.status = if success {
            PhaseStatus::Completed
        } else if phase.can_retry() {
            PhaseStatus::Pending
        } else {
            PhaseStatus::Failed
        };
        let status = phase.status;
        info!(phase_id, attempt = attempt_number, success, status = %status, "attempt finished");
        self.save()?;
        Ok(status)
    }

    /// Close the running attempt and fail the phase regardless of remaining attempts.
    pub fn fail_phase_permanently(
        &mut self,
        phase_id: &str,
        error_message: &str,
        code: FailureCode,
    ) -> Result<(), StateError> {
        let phase = self.phase_mut(phase_id)?;
        if let Some(attempt) = phase.active_attempt_mut() {
            attempt.finish(false, Some(error_message.to_string()), Some(code));
        }
        phase.status = PhaseStatus::Failed;
        warn!(phase_id, code = %code, error_message, "phase failed permanently");
        self.save()
    }

    pub fn skip_phase(&mut self, phase_id: &str) -> Result<(), StateError> {
        self.phase_mut(phase_id)?.status = PhaseStatus::Skipped;
        self.save()
    }

    pub fn block_phase(&mut self, phase_id: &str, dependency: &str) -> Result<(), StateError> {
        self.phase_mut(phase_id)?.status = PhaseStatus::Blocked;
        warn!(phase_id, dependency, "phase blocked by dependency");
        self.save()
    }

    /// Attach a progress snapshot to the running attempt.
    pub fn save_checkpoint(&mut self, phase_id: &str, data: Value) -> Result<(), StateError> {
        let phase = self.phase_mut(phase_id)?;
        let attempt = phase
            .active_attempt_mut()
            .ok_or_else(|| StateError::NoActiveAttempt(phase_id.to_string()))?;
        attempt.checkpoint = Some(data.clone());
        phase.current_checkpoint = Some(data);
        debug!(phase_id, "checkpoint saved");
        self.save()
    }

    pub fn latest_checkpoint(&self, phase_id: &str) -> Option<&Value> {
        self.phases.get(phase_id)?.current_checkpoint.as_ref()
    }

    /// Claim `key` for an externally-visible operation.
    ///
    /// Returns false if any attempt of the phase already claimed it.
    pub fn register_idempotency_key(&mut self, phase_id: &str, key: &str) -> Result<bool, StateError> {
        let phase = self.phase_mut(phase_id)?;
        if phase.idempotency_key_consumed(key) {
            debug!(phase_id, key, "idempotency key already consumed");
            return Ok(false);
        }
        let attempt = phase
            .active_attempt_mut()
            .ok_or_else(|| StateError::NoActiveAttempt(phase_id.to_string()))?;
        attempt.idempotency_keys.insert(key.to_string());
        self.save()?;
        Ok(true)
    }

    /// Give back a key the running attempt claimed for an operation that
    /// did not happen. Keys of earlier attempts stay consumed.
    pub fn release_idempotency_key(&mut self, phase_id: &str, key: &str) -> Result<bool, StateError> {
        let phase = self.phase_mut(phase_id)?;
        let attempt = phase
            .active_attempt_mut()
            .ok_or_else(|| StateError::NoActiveAttempt(phase_id.to_string()))?;
        if !attempt.idempotency_keys.remove(key) {
            return Ok(false);
        }
        debug!(phase_id, key, "idempotency key released");
        self.save()?;
        Ok(true)
    }

    /// Record that an external effect happened.
    pub fn record_side_effect(&mut self, phase_id: &str, effect: &str) -> Result<(), StateError> {
        let phase = self.phase_mut(phase_id)?;
        if let Some(attempt) = phase.active_attempt_mut() {
            attempt.side_effects_attempted.push(effect.to_string());
        }
        phase.side_effects_committed.insert(effect.to_string());
        self.save()
    }

    pub fn has_committed_side_effect(&self, phase_id: &str, effect: &str) -> bool {
        self.phases
            .get(phase_id)
            .is_some_and(|p| p.side_effects_committed.contains(effect))
    }

    /// Close attempts left running by a crashed process.
    ///
    /// Returns the ids of the phases that were interrupted.
    pub fn recover_interrupted(&mut self) -> Result<Vec<String>, StateError> {
        let mut recovered = Vec::new();
        for phase in self.phases.values_mut() {
            let Some(attempt) = phase.active_attempt_mut() else {
                continue;
            };
            attempt.finish(
                false,
                Some("process stopped during attempt".into()),
                Some(FailureCode::Interrupted),
            );
            phase.status = if phase.can_retry() {
                PhaseStatus::Pending
            } else {
                PhaseStatus::Failed
            };
            recovered.push(phase.phase_id.clone());
        }
        if !recovered.is_empty() {
            warn!(phases = ?recovered, "recovered interrupted attempts");
            self.save()?;
        }
        Ok(recovered)
    }

    /// Persist the full state, keeping the previous document as a backup.
    pub fn save(&self) -> Result<(), StateError> {
        self.write_document().map_err(StateError::Persistence)
    }

    fn write_document(&self) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }
        let doc = StateDocument {
            run_id: self.run_id.clone(),
            updated_at: Utc::now(),
            phases: self.phases().into_iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&doc).context("Failed to serialize executor state")?;

        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        if self.state_file.exists() && read_document(&self.state_file).is_ok() {
            fs::rename(&self.state_file, self.backup_file())
                .context("Failed to rotate state backup")?;
        }
        fs::rename(&tmp, &self.state_file)
            .with_context(|| format!("Failed to move state into {}", self.state_file.display()))?;
        Ok(())
    }

    fn read_with_fallback(&self) -> Result<Option<StateDocument>, StateError> {
        if !self.state_file.exists() && !self.backup_file().exists() {
            return Ok(None);
        }
        match read_document(&self.state_file) {
            Ok(doc) => return Ok(Some(doc)),
            Err(e) => warn!(
                path = %self.state_file.display(),
                error = %e,
                "primary state unreadable, falling back to backup"
            ),
        }
        let backup = self.backup_file();
        read_document(&backup).map(Some).map_err(|e| {
            StateError::Persistence(e.context("Both primary and backup state files are unreadable"))
        })
    }
}

fn backup_path(state_file: &Path) -> PathBuf {
    let mut name = state_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    state_file.with_file_name(name)
}

fn read_document(path: &Path) -> Result<StateDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file {}", path.display()))
}
