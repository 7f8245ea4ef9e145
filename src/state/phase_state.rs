//! Relational phase state with optimistic concurrency.
//!
//! Every mutating write conditions on the `version` this manager last read
//! for the phase. A mismatch (or a serialization/deadlock report from the
//! store) surfaces as [`StateError::OptimisticLock`] and is never retried
//! here: the caller reloads with [`PhaseStateManager::load_or_create_default`]
//! and recomputes its mutation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use ratchet_common::{FailureCode, PhaseStatus};
use tracing::{debug, info, warn};

use super::retry::{RetryPolicy, with_store_retry};
use super::store::{PersistedPhaseRow, PhaseStore, UpdateOutcome};
use crate::errors::{StateError, StoreError};

/// Column changes for a conditional update. `None` leaves a column as read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptUpdate {
    pub state: Option<PhaseStatus>,
    pub retry_attempt: Option<u32>,
    pub revision_epoch: Option<u32>,
    pub escalation_level: Option<u32>,
    pub failure: Option<(String, FailureCode)>,
    /// Clear the recorded failure (on success).
    pub clear_failure: bool,
}

pub struct PhaseStateManager {
    run_id: String,
    store: Box<dyn PhaseStore>,
    retry: RetryPolicy,
    /// Last row read or written per phase; its version guards the next write.
    rows: HashMap<String, PersistedPhaseRow>,
}

impl PhaseStateManager {
    pub fn new(run_id: &str, store: Box<dyn PhaseStore>, retry: RetryPolicy) -> Self {
        Self {
            run_id: run_id.to_string(),
            store,
            retry,
            rows: HashMap::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Read the persisted row, creating a default one if none exists.
    ///
    /// Transient store errors are retried; everything else is returned at once.
    pub fn load_or_create_default(&mut self, phase_id: &str) -> Result<PersistedPhaseRow, StateError> {
        let run_id = self.run_id.clone();
        let store = &mut self.store;
        let row = with_store_retry(&self.retry, "load_or_create_default", || {
            if let Some(row) = store.fetch(&run_id, phase_id)? {
                return Ok(row);
            }
            store.insert_if_absent(&PersistedPhaseRow::new_default(&run_id, phase_id))?;
            store
                .fetch(&run_id, phase_id)?
                .ok_or_else(|| StoreError::new(crate::errors::StoreErrorKind::NotFound, phase_id))
        })
        .map_err(|e| conflict_or_store(phase_id, 0, e))?;

        debug!(phase_id, version = row.version, state = %row.state, "loaded phase row");
        self.rows.insert(phase_id.to_string(), row.clone());
        Ok(row)
    }

    /// Read-only lookup for schedulers and reporting.
    ///
    /// Store failures are logged and reported as `None`; a missing read must
    /// not halt scheduling.
    pub fn get_phase_row(&mut self, phase_id: &str) -> Option<PersistedPhaseRow> {
        let (run_id, store) = (&self.run_id, &mut self.store);
        match with_store_retry(&self.retry, "get_phase_row", || store.fetch(run_id, phase_id)) {
            Ok(row) => row,
            Err(e) => {
                warn!(phase_id, error = %e, "phase row read failed, treating as absent");
                None
            }
        }
    }

    /// The row this manager last observed for `phase_id`, if any.
    pub fn cached_row(&self, phase_id: &str) -> Option<&PersistedPhaseRow> {
        self.rows.get(phase_id)
    }

    /// Conditionally write `update` against the version last read.
    pub fn update_attempts(
        &mut self,
        phase_id: &str,
        update: AttemptUpdate,
    ) -> Result<PersistedPhaseRow, StateError> {
        let current = match self.rows.get(phase_id) {
            Some(row) => row.clone(),
            None => self.load_or_create_default(phase_id)?,
        };
        let expected = current.version;

        let mut next = current;
        if let Some(state) = update.state {
            next.state = state;
        }
        if let Some(retry_attempt) = update.retry_attempt {
            next.retry_attempt = retry_attempt;
        }
        if let Some(epoch) = update.revision_epoch {
            next.revision_epoch = epoch;
        }
        if let Some(level) = update.escalation_level {
            next.escalation_level = level;
        }
        if update.clear_failure {
            next.last_failure_reason = None;
            next.last_failure_code = None;
        }
        if let Some((reason, code)) = update.failure {
            next.last_failure_reason = Some(reason);
            next.last_failure_code = Some(code);
        }
        next.last_attempt_timestamp = Some(Utc::now());

        let store = &mut self.store;
        let outcome = with_store_retry(&self.retry, "update_attempts", || {
            store.update_if_version(&next, expected)
        })
        .map_err(|e| conflict_or_store(phase_id, expected, e))?;

        match outcome {
            UpdateOutcome::Updated(row) => {
                debug!(phase_id, version = row.version, state = %row.state, "phase row updated");
                self.rows.insert(phase_id.to_string(), row.clone());
                Ok(row)
            }
            UpdateOutcome::VersionMismatch { found } => {
                warn!(phase_id, expected, ?found, "optimistic lock conflict");
                Err(StateError::OptimisticLock {
                    phase_id: phase_id.to_string(),
                    expected,
                    found,
                })
            }
        }
    }

    /// Record the start of an attempt.
    pub fn mark_in_progress(&mut self, phase_id: &str, retry_attempt: u32) -> Result<PersistedPhaseRow, StateError> {
        self.update_attempts(
            phase_id,
            AttemptUpdate {
                state: Some(PhaseStatus::InProgress),
                retry_attempt: Some(retry_attempt),
                ..Default::default()
            },
        )
    }

    pub fn mark_complete(&mut self, phase_id: &str) -> Result<PersistedPhaseRow, StateError> {
        info!(phase_id, "phase complete");
        self.update_attempts(
            phase_id,
            AttemptUpdate {
                state: Some(PhaseStatus::Completed),
                clear_failure: true,
                ..Default::default()
            },
        )
    }

    /// Record a failed attempt. `final_failure` decides between Failed and
    /// Pending (more attempts to come).
    pub fn mark_failed(
        &mut self,
        phase_id: &str,
        reason: &str,
        code: FailureCode,
        final_failure: bool,
    ) -> Result<PersistedPhaseRow, StateError> {
        let current = match self.rows.get(phase_id) {
            Some(row) => row.clone(),
            None => self.load_or_create_default(phase_id)?,
        };
        let escalation_level = if code.is_fatal() {
            Some(current.escalation_level + 1)
        } else {
            None
        };
        warn!(phase_id, code = %code, reason, final_failure, "phase attempt failed");
        self.update_attempts(
            phase_id,
            AttemptUpdate {
                state: Some(if final_failure {
                    PhaseStatus::Failed
                } else {
                    PhaseStatus::Pending
                }),
                retry_attempt: Some(current.retry_attempt + 1),
                escalation_level,
                failure: Some((reason.to_string(), code)),
                ..Default::default()
            },
        )
    }

    /// Send a phase back to Pending for re-planning under a new revision epoch.
    pub fn reset_phase(&mut self, phase_id: &str) -> Result<PersistedPhaseRow, StateError> {
        let current = self.load_or_create_default(phase_id)?;
        self.update_attempts(
            phase_id,
            AttemptUpdate {
                state: Some(PhaseStatus::Pending),
                retry_attempt: Some(0),
                revision_epoch: Some(current.revision_epoch + 1),
                clear_failure: true,
                ..Default::default()
            },
        )
    }

    /// Fail every in-progress row of this run that has not moved for `threshold`.
    ///
    /// Rows another writer advanced in the meantime are left alone.
    pub fn fail_stale(&mut self, threshold: Duration) -> Result<Vec<String>, StateError> {
        let run_id = self.run_id.clone();
        let store = &mut self.store;
        let rows = with_store_retry(&self.retry, "list_in_progress", || {
            store.list_in_state(Some(&run_id), PhaseStatus::InProgress)
        })?;

        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut failed = Vec::new();

        for row in rows {
            let last_seen = row.last_attempt_timestamp.unwrap_or(row.updated_at);
            if now - last_seen < threshold {
                continue;
            }
            let phase_id = row.phase_id.clone();
            self.rows.insert(phase_id.clone(), row);
            let reason = format!("no progress since {}", last_seen.to_rfc3339());
            match self.mark_failed(&phase_id, &reason, FailureCode::StaleInProgress, true) {
                Ok(_) => failed.push(phase_id),
                Err(e) if e.is_conflict() => {
                    debug!(phase_id, "stale row advanced concurrently, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if !failed.is_empty() {
            warn!(count = failed.len(), phases = ?failed, "failed stale in-progress phases");
        }
        Ok(failed)
    }
}

fn conflict_or_store(phase_id: &str, expected: i64, err: StoreError) -> StateError {
    if err.is_conflict() {
        StateError::OptimisticLock {
            phase_id: phase_id.to_string(),
            expected,
            found: None,
        }
    } else {
        StateError::Store(err)
    }
}
