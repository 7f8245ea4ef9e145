//! Git-backed savepoints and rollback.

pub mod audit;
pub mod git;
pub mod manager;

pub use audit::{AuditAction, AuditEntry, RollbackAuditLog};
pub use git::{GitCli, GitInvokeError, GitOutput};
pub use manager::{
    RollbackManager, RollbackOutcome, RollbackSettings, Savepoint, TAG_PREFIX, sanitize_component,
    savepoint_name,
};
