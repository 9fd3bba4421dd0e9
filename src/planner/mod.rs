//! Planning and applying.
//!
//! The planner turns a resolved template set plus observed/recorded state
//! into an ordered apply plan, and the executor converges the provider
//! toward it through a bounded concurrent worker pool.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ActionResult, ExecutionResult, FailureEntry, PlanExecutor};
pub use plan::{ActionType, ApplyPlan, PlannedAction};
