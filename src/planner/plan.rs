//! Apply plan types and construction.
//!
//! A plan is an ordered action list derived from a diff. Actions carry the
//! indices of the actions they depend on; the executor uses those edges for
//! scheduling, so declared resources follow the dependency graph and orphan
//! deletes honor lock-before-target ordering.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::state::StackState;
use crate::template::TemplateSet;

use super::diff::{DiffResult, DiffType};

/// A complete apply plan.
#[derive(Debug)]
pub struct ApplyPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Template hash this plan is based on.
    pub template_hash: String,
    /// Planned actions in a topologically valid order.
    pub actions: Vec<PlannedAction>,
    /// Validation warnings carried into the plan display.
    pub warnings: Vec<String>,
}

/// A single planned action.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Resource address.
    pub address: String,
    /// Index into the template's resource list (absent for orphan deletes).
    pub resource_index: Option<usize>,
    /// Provider-assigned identifier, when already known.
    pub provider_id: Option<String>,
    /// Reason for this action.
    pub reason: String,
    /// New spec hash (if applicable).
    pub new_hash: Option<String>,
    /// Action indices that must complete first.
    pub dependencies: Vec<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// Create the resource.
    Create,
    /// Update the resource in place.
    Update,
    /// Delete the resource.
    Delete,
    /// Look up an existing resource; no mutation.
    Resolve,
    /// No change required; carries recorded attributes forward.
    Noop,
}

impl ApplyPlan {
    /// Builds a plan from a diff.
    ///
    /// Declared resources are ordered by the dependency graph's topological
    /// order (declaration order breaking ties); orphan deletes are appended
    /// with lock deletes ordered before their protected targets.
    ///
    /// # Errors
    ///
    /// Returns a cycle error if the dependency graph is not acyclic.
    pub fn from_diff(
        diff: &DiffResult,
        template: &TemplateSet,
        graph: &ResourceGraph,
        state: Option<&StackState>,
        template_hash: &str,
        warnings: Vec<String>,
    ) -> Result<Self> {
        let order = graph.topo_order()?;
        let mut actions: Vec<PlannedAction> = Vec::with_capacity(diff.diffs.len());
        let mut action_by_decl = vec![usize::MAX; template.resources.len()];

        for &decl_idx in &order {
            let resource = &template.resources[decl_idx];
            let address = resource.address();
            let Some(resource_diff) = diff.diff_for(&address) else {
                continue;
            };

            let (action_type, reason) = match resource_diff.diff_type {
                DiffType::Create => (ActionType::Create, String::from("Resource not yet created")),
                DiffType::Update => (ActionType::Update, String::from("Declaration changed")),
                DiffType::Drift => (
                    ActionType::Update,
                    String::from("Out-of-band drift detected"),
                ),
                DiffType::NoChange => (ActionType::Noop, String::from("Already converged")),
                DiffType::Resolve => (
                    ActionType::Resolve,
                    String::from("Existing resource lookup"),
                ),
                // Deletes only exist for orphans, handled below.
                DiffType::Delete => continue,
            };

            let dependencies = graph
                .direct_dependencies(decl_idx)
                .into_iter()
                .map(|dep| action_by_decl[dep])
                .filter(|&idx| idx != usize::MAX)
                .collect();

            action_by_decl[decl_idx] = actions.len();
            actions.push(PlannedAction {
                action_type,
                address,
                resource_index: Some(decl_idx),
                provider_id: resource_diff.provider_id.clone(),
                reason,
                new_hash: resource_diff.new_hash.clone(),
                dependencies,
            });
        }

        // Orphan deletes. The only ordering state can still witness is the
        // lock registry: a lock's delete must precede its target's delete.
        let mut delete_action_by_address: Vec<(String, usize)> = Vec::new();
        for resource_diff in &diff.diffs {
            if resource_diff.diff_type != DiffType::Delete {
                continue;
            }
            let idx = actions.len();
            delete_action_by_address.push((resource_diff.address.clone(), idx));
            actions.push(PlannedAction {
                action_type: ActionType::Delete,
                address: resource_diff.address.clone(),
                resource_index: None,
                provider_id: resource_diff.provider_id.clone(),
                reason: String::from("Removed from template"),
                new_hash: None,
                dependencies: vec![],
            });
        }

        if let Some(state) = state {
            for (address, idx) in &delete_action_by_address {
                if let Some(lock_address) = state.lock_for_target(address)
                    && let Some(&(_, lock_idx)) = delete_action_by_address
                        .iter()
                        .find(|(addr, _)| addr == lock_address)
                {
                    actions[*idx].dependencies.push(lock_idx);
                }
            }
        }

        Ok(Self {
            created_at: Utc::now(),
            template_hash: template_hash.to_string(),
            actions,
            warnings,
        })
    }

    /// Creates an empty plan (no resources declared or recorded).
    #[must_use]
    pub fn empty(template_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            template_hash: template_hash.to_string(),
            actions: vec![],
            warnings: vec![],
        }
    }

    /// Returns true if the plan performs no mutating action.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.actions.iter().all(|a| {
            matches!(a.action_type, ActionType::Noop | ActionType::Resolve)
        })
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of mutating actions.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| {
                matches!(
                    a.action_type,
                    ActionType::Create | ActionType::Update | ActionType::Delete
                )
            })
            .count()
    }

    /// Returns the number of actions of a given type.
    #[must_use]
    pub fn count_of(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Returns actions that can start immediately (no dependencies).
    #[must_use]
    pub fn ready_actions(&self) -> Vec<&PlannedAction> {
        self.actions
            .iter()
            .filter(|a| a.dependencies.is_empty())
            .collect()
    }

    /// Gets actions that depend on a specific action index.
    #[must_use]
    pub fn dependent_actions(&self, action_idx: usize) -> Vec<(usize, &PlannedAction)> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.dependencies.contains(&action_idx))
            .collect()
    }
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create '{}'", self.address),
            ActionType::Update => format!("Update '{}'", self.address),
            ActionType::Delete => format!("Delete '{}'", self.address),
            ActionType::Resolve => format!("Resolve existing '{}'", self.address),
            ActionType::Noop => format!("No change for '{}'", self.address),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Resolve => "resolve",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.address)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ApplyPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Apply plan ({} actions):", self.actions.len())?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {i}. {action}")?;
        }

        if !self.warnings.is_empty() {
            writeln!(f, "\nWarnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {warning}")?;
            }
        }

        Ok(())
    }
}
