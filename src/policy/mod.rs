//! Which paths a patch may touch, and applying it behind a savepoint.

pub mod governed;
pub mod patch;
pub mod patch_policy;

pub use governed::{
    ApplyOutcome, CRITICAL_PROTECTED, GovernedApplyPath, effective_allowed, effective_protected,
};
pub use patch::Patch;
pub use patch_policy::{PatchPolicy, PathViolation, ValidationResult, ViolationKind};
