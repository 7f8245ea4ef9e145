//! Runs phases end to end against an agent and a validation runner.

pub mod agent;
pub mod runner;
pub mod validation;

pub use agent::{AgentClient, AgentRequest, AgentResponse, build_phase_prompt};
pub use runner::{AttemptCheckpoint, PhaseExecutor, PhaseSummary, RunSummary};
pub use validation::{
    CommandValidationRunner, ValidationOutcome, ValidationReport, ValidationRequest,
    ValidationRunner,
};
