//! State tracking for applied resource sets.
//!
//! State records what strata last applied per resource (provider id, spec
//! hash, resulting attributes) so re-runs can converge without blind
//! re-submission. The provider remains the source of truth; recorded state
//! only short-circuits work when both agree.

mod local;
mod lock;
mod store;
mod types;

pub use local::LocalStateStore;
pub use lock::{generate_holder_id, LockInfo, RunLock, LOCK_EXPIRY_SECS};
pub use store::StateStore;
pub use types::{
    ApplyHistoryEntry, ApplyOperation, ResourceState, ResourceStatus, StackState, STATE_VERSION,
};
