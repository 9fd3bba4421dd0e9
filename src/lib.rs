// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Generated mocks in test builds carry no doc comments
#![cfg_attr(test, allow(missing_docs))]

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # strata
//!
//! A declarative, idempotent provisioner for dependency-ordered cloud
//! resource graphs.
//!
//! ## Overview
//!
//! strata reads a YAML template set describing cloud resources (accounts,
//! deployments, storage, networking, role assignments, locks), derives the
//! dependency graph from cross-resource references, and converges the
//! provider toward the desired state:
//!
//! - Define the resource set as code in a `strata.deploy.yaml` template
//! - Plan a deterministic, topologically valid apply order
//! - Apply through a bounded concurrent worker pool
//! - Re-run at any time: converged resources produce zero mutating calls
//!
//! ## Architecture
//!
//! The system is built around desired-state reconciliation:
//!
//! 1. **Desired State**: declared in the template set
//! 2. **Observed State**: read back from the provider control plane
//! 3. **Reconciler**: diffs the two and executes the difference
//!
//! ## Modules
//!
//! - [`template`]: template parsing, parameters, validation, hashing
//! - [`graph`]: reference graph construction and topological ordering
//! - [`planner`]: diff computation, plan construction, concurrent execution
//! - [`provider`]: provider control-plane API boundary
//! - [`state`]: recorded state backends and run locking
//! - [`reconciler`]: the observe/diff/plan/execute convergence loop
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: ai-workload
//!   location: eastus2
//!
//! resources:
//!   - type: storage.account
//!     name: main
//!     properties:
//!       sku: Standard_LRS
//!       public_network_access: Disabled
//!
//!   - type: network.private_endpoint
//!     name: storage-pe
//!     properties:
//!       target_id: ${storage.account/main:id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;
pub mod template;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use error::{Result, StrataError};
pub use graph::ResourceGraph;
pub use planner::{ApplyPlan, DiffEngine, PlanExecutor};
pub use provider::{HttpProvider, ProviderApi};
pub use reconciler::{ConvergenceResult, Reconciler};
pub use state::{LocalStateStore, StackState, StateStore};
pub use template::{SpecHasher, TemplateParser, TemplateSet, TemplateValidator};
