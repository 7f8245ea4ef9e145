//! Narrow relational store interface for persisted phase rows.
//!
//! The engine needs only a fetch, an insert-if-absent, a listing by state,
//! and a conditional update keyed on the row's `version` column. Any
//! relational or embedded engine that can provide those satisfies it.

use chrono::{DateTime, Utc};
use ratchet_common::{FailureCode, PhaseStatus};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// One persisted row per phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPhaseRow {
    pub phase_id: String,
    pub run_id: String,
    pub state: PhaseStatus,
    pub retry_attempt: u32,
    pub revision_epoch: u32,
    pub escalation_level: u32,
    pub last_failure_reason: Option<String>,
    pub last_failure_code: Option<FailureCode>,
    pub last_attempt_timestamp: Option<DateTime<Utc>>,
    /// Incremented atomically by every successful write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedPhaseRow {
    /// Fresh row for a phase that has never been persisted.
    pub fn new_default(run_id: &str, phase_id: &str) -> Self {
        let now = Utc::now();
        Self {
            phase_id: phase_id.to_string(),
            run_id: run_id.to_string(),
            state: PhaseStatus::Pending,
            retry_attempt: 0,
            revision_epoch: 0,
            escalation_level: 0,
            last_failure_reason: None,
            last_failure_code: None,
            last_attempt_timestamp: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Written; carries the row as stored, with the incremented version.
    Updated(PersistedPhaseRow),
    /// The stored version differs from the expected one (or the row is gone).
    VersionMismatch { found: Option<i64> },
}

pub trait PhaseStore: Send {
    fn fetch(&mut self, run_id: &str, phase_id: &str) -> Result<Option<PersistedPhaseRow>, StoreError>;

    /// Insert `row` unless a row with the same run and phase id already exists.
    fn insert_if_absent(&mut self, row: &PersistedPhaseRow) -> Result<(), StoreError>;

    /// Lock the row, compare its version to `expected_version`, and on match
    /// write `row`'s mutable columns with `version = expected_version + 1`.
    fn update_if_version(
        &mut self,
        row: &PersistedPhaseRow,
        expected_version: i64,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Rows currently in `state`, optionally restricted to one run.
    fn list_in_state(
        &mut self,
        run_id: Option<&str>,
        state: PhaseStatus,
    ) -> Result<Vec<PersistedPhaseRow>, StoreError>;
}
