use serde::{Deserialize, Serialize};

/// Machine-stable reason attached to every phase or attempt failure.
///
/// The string form is persisted (state file, relational rows, audit log)
/// and consumed by dashboards, so variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// Patch touched a protected or out-of-scope path.
    PolicyViolation,
    /// Patch could not be applied; the tree was rolled back.
    ApplyFailed,
    /// Restoring a savepoint failed. Fatal for the phase.
    RollbackFailed,
    /// No savepoint could be created, so nothing was applied.
    SavepointUnavailable,
    /// External validation (CI) reported failures.
    ValidationFailed,
    /// Agent kept truncating past the continuation round limit.
    TruncationExhausted,
    /// Agent output could not be parsed into a patch.
    MalformedOutput,
    /// The agent client returned an error.
    AgentError,
    /// The process stopped while the attempt was running.
    Interrupted,
    /// The phase sat in progress past the staleness threshold.
    StaleInProgress,
    /// A dependency failed or was blocked.
    DependencyFailed,
    /// A concurrent writer advanced the persisted row.
    StateConflict,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::PolicyViolation => "policy_violation",
            FailureCode::ApplyFailed => "apply_failed",
            FailureCode::RollbackFailed => "rollback_failed",
            FailureCode::SavepointUnavailable => "savepoint_unavailable",
            FailureCode::ValidationFailed => "validation_failed",
            FailureCode::TruncationExhausted => "truncation_exhausted",
            FailureCode::MalformedOutput => "malformed_output",
            FailureCode::AgentError => "agent_error",
            FailureCode::Interrupted => "interrupted",
            FailureCode::StaleInProgress => "stale_in_progress",
            FailureCode::DependencyFailed => "dependency_failed",
            FailureCode::StateConflict => "state_conflict",
        }
    }

    /// Failures after which the phase must not be retried without an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureCode::RollbackFailed)
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "policy_violation" => FailureCode::PolicyViolation,
            "apply_failed" => FailureCode::ApplyFailed,
            "rollback_failed" => FailureCode::RollbackFailed,
            "savepoint_unavailable" => FailureCode::SavepointUnavailable,
            "validation_failed" => FailureCode::ValidationFailed,
            "truncation_exhausted" => FailureCode::TruncationExhausted,
            "malformed_output" => FailureCode::MalformedOutput,
            "agent_error" => FailureCode::AgentError,
            "interrupted" => FailureCode::Interrupted,
            "stale_in_progress" => FailureCode::StaleInProgress,
            "dependency_failed" => FailureCode::DependencyFailed,
            "state_conflict" => FailureCode::StateConflict,
            other => return Err(format!("unknown failure code '{}'", other)),
        };
        Ok(code)
    }
}
