//! Durable execution state.
//!
//! Two layers live here: the relational per-phase row guarded by an
//! optimistic version ([`PhaseStateManager`]) and the per-run JSON document
//! holding phases, attempts, checkpoints and idempotency keys
//! ([`ExecutorStateManager`]).

pub mod executor_state;
pub mod handle;
pub mod phase_state;
pub mod retry;
pub mod sqlite;
pub mod store;

pub use executor_state::{DependencyState, ExecutorStateManager};
pub use handle::StateHandle;
pub use phase_state::{AttemptUpdate, PhaseStateManager};
pub use retry::{RetryPolicy, with_store_retry};
pub use sqlite::SqlitePhaseStore;
pub use store::{PersistedPhaseRow, PhaseStore, UpdateOutcome};
