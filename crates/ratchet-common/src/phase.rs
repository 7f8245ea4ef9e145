//! Phase and attempt records.
//!
//! A [`Phase`] is one unit of orchestrated work with its own retry budget
//! and dependency list. Each execution of it is an [`Attempt`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::failure::FailureCode;
use crate::output::OutputFormat;

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Blocked => "blocked",
        }
    }

    /// Completed and skipped phases never execute again.
    pub fn is_done(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }

    /// No further attempts will be made without an operator.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Skipped | PhaseStatus::Failed | PhaseStatus::Blocked
        )
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "in_progress" => Ok(PhaseStatus::InProgress),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            "skipped" => Ok(PhaseStatus::Skipped),
            "blocked" => Ok(PhaseStatus::Blocked),
            other => Err(format!("unknown phase status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
}

/// One execution instance of a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_id: Uuid,
    /// 0-based, strictly increasing per phase.
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<FailureCode>,
    #[serde(default)]
    pub side_effects_attempted: Vec<String>,
    /// Keys claimed for externally-visible operations during this attempt.
    #[serde(default)]
    pub idempotency_keys: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,
}

impl Attempt {
    pub fn new(attempt_number: u32) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            attempt_number,
            started_at: Utc::now(),
            completed_at: None,
            status: AttemptStatus::Running,
            error_message: None,
            failure_code: None,
            side_effects_attempted: Vec::new(),
            idempotency_keys: BTreeSet::new(),
            checkpoint: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == AttemptStatus::Running
    }

    /// Close the attempt with the given outcome.
    pub fn finish(&mut self, success: bool, error: Option<String>, code: Option<FailureCode>) {
        self.completed_at = Some(Utc::now());
        if success {
            self.status = AttemptStatus::Succeeded;
        } else {
            self.status = AttemptStatus::Failed;
            self.error_message = error;
            self.failure_code = code;
        }
    }
}

/// A discrete unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: String,
    pub run_id: String,
    pub phase_number: u32,
    pub name: String,
    /// Phase ids that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: PhaseStatus,
    pub max_attempts: u32,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_checkpoint: Option<Value>,
    /// External effects already applied, for idempotency across restarts.
    #[serde(default)]
    pub side_effects_committed: BTreeSet<String>,
    /// What the agent is asked to do.
    #[serde(default)]
    pub instructions: String,
    /// Files the agent is expected to emit.
    #[serde(default)]
    pub deliverables: Vec<String>,
    /// Paths this phase may touch. Empty means unrestricted.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Phase {
    pub fn new(run_id: &str, phase_id: &str, phase_number: u32, name: &str, max_attempts: u32) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            run_id: run_id.to_string(),
            phase_number,
            name: name.to_string(),
            dependencies: Vec::new(),
            status: PhaseStatus::Pending,
            max_attempts,
            attempts: Vec::new(),
            current_checkpoint: None,
            side_effects_committed: BTreeSet::new(),
            instructions: String::new(),
            deliverables: Vec::new(),
            scope: Vec::new(),
            output_format: OutputFormat::default(),
        }
    }

    /// True while the phase is not done and attempts remain.
    pub fn can_retry(&self) -> bool {
        !self.status.is_done() && self.attempts_remaining() > 0
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts.len() as u32)
    }

    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut()
    }

    /// The running attempt, if one is open.
    pub fn active_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut().filter(|a| a.is_running())
    }

    /// Number the next attempt would get.
    pub fn next_attempt_number(&self) -> u32 {
        self.attempts
            .last()
            .map(|a| a.attempt_number + 1)
            .unwrap_or(0)
    }

    /// True if any attempt of this phase already claimed `key`.
    pub fn idempotency_key_consumed(&self, key: &str) -> bool {
        self.attempts.iter().any(|a| a.idempotency_keys.contains(key))
    }

    /// Reason code of the most recent failed attempt.
    pub fn last_failure_code(&self) -> Option<FailureCode> {
        self.attempts.iter().rev().find_map(|a| a.failure_code)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.error_message.as_deref())
    }
}
