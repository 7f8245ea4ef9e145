//! Typed error hierarchy for the ratchet engine.
//!
//! Each subsystem has its own enum:
//! - `StoreError`: relational store failures, classified transient vs fatal
//! - `StateError`: phase state machine and persistence failures
//! - `RollbackError`: savepoint creation and restore failures
//! - `ApplyError`: patch parsing and application failures
//! - `EngineError`: executor-level failures

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Structured classification of a store failure.
///
/// Adapters map their native error codes onto these kinds; callers never
/// inspect message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Connection dropped or could not be opened.
    ConnectionLost,
    /// The store did not answer in time.
    Timeout,
    /// A concurrent transaction holds the write lock.
    Serialization,
    Deadlock,
    /// Conditional update found a different version.
    VersionConflict,
    NotFound,
    Constraint,
    Other,
}

impl StoreErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreErrorKind::ConnectionLost => "connection_lost",
            StoreErrorKind::Timeout => "timeout",
            StoreErrorKind::Serialization => "serialization",
            StoreErrorKind::Deadlock => "deadlock",
            StoreErrorKind::VersionConflict => "version_conflict",
            StoreErrorKind::NotFound => "not_found",
            StoreErrorKind::Constraint => "constraint",
            StoreErrorKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("store error ({}): {message}", kind.as_str())]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Only connection loss and timeouts are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::ConnectionLost | StoreErrorKind::Timeout
        )
    }

    /// The store detected a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::Serialization
                | StoreErrorKind::Deadlock
                | StoreErrorKind::VersionConflict
        )
    }
}

/// Errors from the phase state managers.
#[derive(Debug, Error)]
pub enum StateError {
    /// The row changed since it was read. Never retried; reload and recompute.
    #[error("optimistic lock conflict on phase {phase_id}: expected version {expected}, found {found:?}")]
    OptimisticLock {
        phase_id: String,
        expected: i64,
        found: Option<i64>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown phase {0}")]
    UnknownPhase(String),

    #[error("Phase {phase_id} is {status} and cannot start another attempt")]
    PhaseTerminal { phase_id: String, status: String },

    #[error("Phase {phase_id} has used all {max_attempts} attempts")]
    AttemptsExhausted { phase_id: String, max_attempts: u32 },

    #[error("Phase {0} has no running attempt")]
    NoActiveAttempt(String),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("State persistence failed: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::OptimisticLock { .. })
    }
}

/// Savepoint failures, each with a machine-stable code.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("No HEAD commit to tag; the repository has no history")]
    NoHead,

    #[error("git tag timed out after {0:?}")]
    TagTimeout(Duration),

    #[error("git tag failed: {0}")]
    TagFailed(String),

    #[error("Listing savepoints failed: {0}")]
    ListFailed(String),

    #[error("git reset timed out after {0:?}")]
    ResetTimeout(Duration),

    #[error("git reset to {savepoint} failed: {message}")]
    ResetFailed { savepoint: String, message: String },

    #[error("git clean timed out after {0:?}")]
    CleanTimeout(Duration),

    #[error("git clean failed: {0}")]
    CleanFailed(String),

    #[error("Deleting savepoint {savepoint} failed: {message}")]
    DeleteFailed { savepoint: String, message: String },

    #[error("git is not available: {0}")]
    GitUnavailable(#[source] std::io::Error),

    #[error("Audit log write failed at {path}: {source}")]
    AuditWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RollbackError {
    pub fn code(&self) -> &'static str {
        match self {
            RollbackError::NoHead => "no_head",
            RollbackError::TagTimeout(_) => "tag_timeout",
            RollbackError::TagFailed(_) => "tag_failed",
            RollbackError::ListFailed(_) => "list_failed",
            RollbackError::ResetTimeout(_) => "reset_timeout",
            RollbackError::ResetFailed { .. } => "reset_failed",
            RollbackError::CleanTimeout(_) => "clean_timeout",
            RollbackError::CleanFailed(_) => "clean_failed",
            RollbackError::DeleteFailed { .. } => "delete_failed",
            RollbackError::GitUnavailable(_) => "git_unavailable",
            RollbackError::AuditWrite { .. } => "audit_write_failed",
        }
    }

    /// A savepoint existed but the tree could not be restored to it.
    ///
    /// The working tree is in an unknown state; apply must not be retried
    /// without operator intervention.
    pub fn is_restore_failure(&self) -> bool {
        matches!(
            self,
            RollbackError::ResetTimeout(_)
                | RollbackError::ResetFailed { .. }
                | RollbackError::CleanTimeout(_)
                | RollbackError::CleanFailed(_)
        )
    }
}

/// Patch parsing and application failures.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Malformed patch: {0}")]
    Malformed(String),

    #[error("Patch does not apply: {0}")]
    Rejected(String),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git apply timed out after {0:?}")]
    Timeout(Duration),

    #[error("git is not available: {0}")]
    GitUnavailable(#[source] std::io::Error),
}

/// Errors surfaced by the phase executor.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error("Agent request failed: {0}")]
    Agent(#[source] anyhow::Error),

    #[error("Validation runner failed: {0}")]
    Validation(#[source] anyhow::Error),

    #[error("Failed to write artifact at {path}: {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
