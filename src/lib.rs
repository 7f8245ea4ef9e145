//! Phase execution and recovery engine.
//!
//! Runs agent-driven build phases against a git working tree: every patch
//! passes a path policy and is applied behind a savepoint tag, truncated
//! agent output is recovered through continuation requests, and phase and
//! attempt state survives crashes and concurrent writers.

pub mod config;
pub mod errors;
pub mod executor;
pub mod features;
pub mod logging;
pub mod phase;
pub mod policy;
pub mod recovery;
pub mod rollback;
pub mod state;
pub mod util;

pub use config::{EngineConfig, RunPaths};
pub use errors::{ApplyError, EngineError, RollbackError, StateError, StoreError, StoreErrorKind};
pub use executor::{AgentClient, PhaseExecutor, RunSummary, ValidationRunner};
pub use features::{Feature, FeatureFlags};
pub use phase::{PhaseDefinition, PhasesFile};
pub use ratchet_common::{
    Attempt, AttemptStatus, FailureCode, OutputFormat, Phase, PhaseStatus, StopReason,
};
