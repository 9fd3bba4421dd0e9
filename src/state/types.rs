//! State types for tracking applied resources.
//!
//! These types represent the recorded state of a stack: what was applied,
//! with which spec hash, and which attributes came back. They back the
//! idempotence check and the lock registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// The complete recorded state for one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last fully applied template set.
    pub template_hash: String,
    /// Recorded state per resource address.
    pub resources: HashMap<String, ResourceState>,
    /// Output values from the last successful apply.
    pub outputs: BTreeMap<String, String>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// Recorded state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource address (`type/name`).
    pub address: String,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Canonical spec hash at last apply.
    pub spec_hash: String,
    /// Current status.
    pub status: ResourceStatus,
    /// True for existing resources that were only resolved, never created.
    #[serde(default)]
    pub existing: bool,
    /// Target address recorded for lock resources.
    #[serde(default)]
    pub lock_target: Option<String>,
    /// Attributes reported by the provider at last apply.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// When the resource was first applied.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Resource status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Apply call in flight.
    Applying,
    /// Applied and converged at last run.
    Applied,
    /// Last apply attempt failed.
    Failed,
    /// Delete call in flight.
    Deleting,
    /// Status is unknown.
    Unknown,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    /// When the run occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: ApplyOperation,
    /// Template hash at the time of the run.
    pub template_hash: String,
    /// Resource addresses touched by the run.
    pub resources: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// A plan+apply run.
    Apply,
    /// A destroy run.
    Destroy,
    /// A read-only refresh of observed state.
    Refresh,
}

impl StackState {
    /// Creates a new empty stack state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            template_hash: String::new(),
            resources: HashMap::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by address.
    #[must_use]
    pub fn get_resource(&self, address: &str) -> Option<&ResourceState> {
        self.resources.get(address)
    }

    /// Gets a mutable reference to a resource by address.
    pub fn get_resource_mut(&mut self, address: &str) -> Option<&mut ResourceState> {
        self.resources.get_mut(address)
    }

    /// Adds or updates a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        self.resources.insert(resource.address.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by address.
    pub fn remove_resource(&mut self, address: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(address);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Returns the lock resource protecting the given address, if any.
    ///
    /// A target is protected while a lock resource whose `lock_target`
    /// names it remains in state.
    #[must_use]
    pub fn lock_for_target(&self, address: &str) -> Option<&str> {
        self.resources.values().find_map(|r| {
            (r.lock_target.as_deref() == Some(address)).then_some(r.address.as_str())
        })
    }

    /// Returns addresses recorded in state but absent from the given set, in
    /// sorted order. These are orphans scheduled for deletion.
    #[must_use]
    pub fn orphaned_addresses(&self, declared: &[String]) -> Vec<String> {
        let mut orphans: Vec<String> = self
            .resources
            .keys()
            .filter(|address| !declared.contains(address))
            .cloned()
            .collect();
        orphans.sort();
        orphans
    }

    /// Adds a history entry, keeping the most recent hundred.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        const MAX_HISTORY: usize = 100;
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource addresses in state.
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl ResourceState {
    /// Creates a new resource state.
    #[must_use]
    pub fn new(address: &str, provider_id: &str, spec_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            address: address.to_string(),
            provider_id: provider_id.to_string(),
            spec_hash: spec_hash.to_string(),
            status: ResourceStatus::Applying,
            existing: false,
            lock_target: None,
            attributes: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Returns true if the resource converged at its last apply.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self.status, ResourceStatus::Applied)
    }
}

impl ApplyHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: ApplyOperation, template_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            template_hash: template_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: ApplyOperation,
        template_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            template_hash: template_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Unknown => "unknown",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
        };
        write!(f, "{op}")
    }
}
