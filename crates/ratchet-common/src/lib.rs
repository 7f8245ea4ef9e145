//! Shared domain types for the ratchet phase execution engine.
//!
//! These types carry no IO. The engine crate persists and mutates them;
//! front ends and fleet workers can depend on this crate alone to read
//! run state.

pub mod failure;
pub mod output;
pub mod phase;

pub use failure::FailureCode;
pub use output::{OutputFormat, StopReason};
pub use phase::{Attempt, AttemptStatus, Phase, PhaseStatus};
