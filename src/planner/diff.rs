//! Diff engine for comparing desired vs recorded vs observed state.
//!
//! Classification is hash-first: each declaration's canonical hash is
//! compared against the hash recorded in state and the hash the provider
//! reports, so an unchanged resource is recognized without comparing full
//! property bags.

use std::collections::HashMap;
use tracing::debug;

use crate::provider::RemoteResource;
use crate::state::StackState;
use crate::template::{ResourceSpec, SpecHasher, TemplateSet};

/// Engine for computing diffs between desired and observed states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Spec hasher.
    hasher: SpecHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource address.
    pub address: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Details about the difference.
    pub details: Vec<DiffDetail>,
    /// Previously recorded hash (if applicable).
    pub old_hash: Option<String>,
    /// New desired hash (if applicable).
    pub new_hash: Option<String>,
    /// Provider-assigned identifier, when already known.
    pub provider_id: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated in place.
    Update,
    /// Resource needs to be deleted (recorded but no longer declared).
    Delete,
    /// Resource is unchanged.
    NoChange,
    /// Provider state changed out-of-band; re-apply to correct.
    Drift,
    /// Existing resource: read-only lookup, no mutation.
    Resolve,
}

/// Detail about a specific difference.
#[derive(Debug, Clone)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Old value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update (including drift corrections).
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
    /// Number of existing-resource lookups.
    pub resolves: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: SpecHasher::new(),
        }
    }

    /// Computes the diff between the desired template and the recorded and
    /// observed states.
    ///
    /// `observed` holds the provider read-back per address for resources
    /// that exist on the provider side.
    #[must_use]
    pub fn compute(
        &self,
        template: &TemplateSet,
        state: Option<&StackState>,
        observed: &HashMap<String, RemoteResource>,
    ) -> DiffResult {
        let mut diffs = Vec::new();

        for resource in &template.resources {
            let address = resource.address();
            if resource.existing {
                diffs.push(ResourceDiff {
                    address,
                    diff_type: DiffType::Resolve,
                    details: vec![],
                    old_hash: None,
                    new_hash: None,
                    provider_id: resource.lookup_id.clone(),
                });
                continue;
            }

            let new_hash = self.hasher.hash_resource(resource);
            let recorded = state.and_then(|s| s.get_resource(&address));
            let remote = observed.get(&address);

            diffs.push(Self::classify(resource, recorded, remote, &new_hash));
        }

        // Resources recorded in state but no longer declared get deleted.
        // Existing-resource records are read-only and simply fall out of
        // state; they are never part of the mutation set.
        if let Some(state) = state {
            for address in state.orphaned_addresses(&template.addresses()) {
                let Some(recorded) = state.get_resource(&address) else {
                    continue;
                };
                if recorded.existing {
                    continue;
                }
                debug!("Resource removed from template: {address}");
                diffs.push(ResourceDiff {
                    address: address.clone(),
                    diff_type: DiffType::Delete,
                    details: vec![DiffDetail {
                        field: String::from("resource"),
                        old_value: Some(recorded.provider_id.clone()),
                        new_value: None,
                    }],
                    old_hash: Some(recorded.spec_hash.clone()),
                    new_hash: None,
                    provider_id: Some(recorded.provider_id.clone()),
                });
            }
        }

        let creates = diffs.iter().filter(|d| d.diff_type == DiffType::Create).count();
        let updates = diffs
            .iter()
            .filter(|d| matches!(d.diff_type, DiffType::Update | DiffType::Drift))
            .count();
        let deletes = diffs.iter().filter(|d| d.diff_type == DiffType::Delete).count();
        let unchanged = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::NoChange)
            .count();
        let resolves = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Resolve)
            .count();

        DiffResult {
            diffs,
            creates,
            updates,
            deletes,
            unchanged,
            resolves,
        }
    }

    /// Classifies a single declared resource.
    fn classify(
        resource: &ResourceSpec,
        recorded: Option<&crate::state::ResourceState>,
        remote: Option<&RemoteResource>,
        new_hash: &str,
    ) -> ResourceDiff {
        let address = resource.address();

        match (remote, recorded) {
            // Nothing anywhere: create.
            (None, None) => {
                debug!("Resource {address} needs to be created");
                ResourceDiff {
                    address: address.clone(),
                    diff_type: DiffType::Create,
                    details: vec![DiffDetail {
                        field: String::from("resource"),
                        old_value: None,
                        new_value: Some(address),
                    }],
                    old_hash: None,
                    new_hash: Some(new_hash.to_string()),
                    provider_id: None,
                }
            }

            // Present on the provider: compare hashes.
            (Some(remote), recorded) => {
                let remote_hash = remote.spec_hash.as_deref();

                if remote_hash.is_some_and(|h| SpecHasher::hashes_match(h, new_hash)) {
                    debug!("Resource {address} is up to date");
                    ResourceDiff {
                        address,
                        diff_type: DiffType::NoChange,
                        details: vec![],
                        old_hash: remote_hash.map(String::from),
                        new_hash: Some(new_hash.to_string()),
                        provider_id: Some(remote.provider_id.clone()),
                    }
                } else {
                    // Recorded hash matching desired means the template did
                    // not change; the provider object moved out-of-band.
                    let recorded_matches = recorded
                        .is_some_and(|r| SpecHasher::hashes_match(&r.spec_hash, new_hash));
                    let diff_type = if recorded_matches {
                        DiffType::Drift
                    } else {
                        DiffType::Update
                    };

                    debug!("Resource {address} needs {diff_type}");
                    ResourceDiff {
                        address,
                        diff_type,
                        details: vec![DiffDetail {
                            field: String::from("spec_hash"),
                            old_value: remote_hash.map(String::from),
                            new_value: Some(new_hash.to_string()),
                        }],
                        old_hash: remote_hash.map(String::from),
                        new_hash: Some(new_hash.to_string()),
                        provider_id: Some(remote.provider_id.clone()),
                    }
                }
            }

            // Recorded but gone on the provider: recreate.
            (None, Some(recorded)) => {
                debug!("Resource {address} recorded but missing on provider, recreating");
                ResourceDiff {
                    address: address.clone(),
                    diff_type: DiffType::Create,
                    details: vec![DiffDetail {
                        field: String::from("resource"),
                        old_value: Some(format!("missing (was {})", recorded.provider_id)),
                        new_value: Some(address),
                    }],
                    old_hash: Some(recorded.spec_hash.clone()),
                    new_hash: Some(new_hash.to_string()),
                    provider_id: None,
                }
            }
        }
    }
}

impl DiffResult {
    /// Returns true if there are any mutating changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of mutating changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Looks up the diff for an address.
    #[must_use]
    pub fn diff_for(&self, address: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.address == address)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
            Self::Drift => "drift",
            Self::Resolve => "resolve",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.address, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceState;
    use crate::template::{ProjectSpec, SpecHasher};
    use std::collections::BTreeMap;

    fn resource(resource_type: &str, name: &str) -> ResourceSpec {
        ResourceSpec {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            scope: None,
            parent: None,
            existing: false,
            lookup_id: None,
            target: None,
            depends_on: vec![],
            properties: BTreeMap::new(),
        }
    }

    fn template(resources: Vec<ResourceSpec>) -> TemplateSet {
        TemplateSet {
            project: ProjectSpec {
                name: String::from("test"),
                environment: String::from("dev"),
                location: None,
                apply_timeout_secs: 120,
                concurrency: 4,
                tags: BTreeMap::new(),
            },
            parameters: vec![],
            resources,
            outputs: vec![],
        }
    }

    fn remote(address: &str, spec_hash: Option<&str>) -> RemoteResource {
        RemoteResource {
            provider_id: format!("/providers/{address}"),
            address: address.to_string(),
            spec_hash: spec_hash.map(String::from),
            attributes: BTreeMap::new(),
            provisioning_state: Some(String::from("Succeeded")),
        }
    }

    #[test]
    fn test_unknown_resource_is_created() {
        let engine = DiffEngine::new();
        let diff = engine.compute(
            &template(vec![resource("storage.account", "main")]),
            None,
            &HashMap::new(),
        );

        assert_eq!(diff.creates, 1);
        assert_eq!(
            diff.diff_for("storage.account/main").unwrap().diff_type,
            DiffType::Create
        );
    }

    #[test]
    fn test_matching_hash_is_no_change() {
        let engine = DiffEngine::new();
        let storage = resource("storage.account", "main");
        let hash = SpecHasher::new().hash_resource(&storage);

        let observed = HashMap::from([(
            String::from("storage.account/main"),
            remote("storage.account/main", Some(&hash)),
        )]);

        let diff = engine.compute(&template(vec![storage]), None, &observed);
        assert!(!diff.has_changes());
        assert_eq!(diff.unchanged, 1);
    }

    #[test]
    fn test_changed_spec_is_update() {
        let engine = DiffEngine::new();
        let storage = resource("storage.account", "main");

        let observed = HashMap::from([(
            String::from("storage.account/main"),
            remote("storage.account/main", Some("stale-hash")),
        )]);

        let mut state = StackState::new("test", "dev");
        state.set_resource(ResourceState::new(
            "storage.account/main",
            "/providers/storage.account/main",
            "stale-hash",
        ));

        let diff = engine.compute(&template(vec![storage]), Some(&state), &observed);
        assert_eq!(diff.updates, 1);
        assert_eq!(
            diff.diff_for("storage.account/main").unwrap().diff_type,
            DiffType::Update
        );
    }

    #[test]
    fn test_out_of_band_change_is_drift() {
        let engine = DiffEngine::new();
        let storage = resource("storage.account", "main");
        let hash = SpecHasher::new().hash_resource(&storage);

        // State recorded the current hash, but the provider object reports a
        // different one: someone changed the resource out-of-band.
        let observed = HashMap::from([(
            String::from("storage.account/main"),
            remote("storage.account/main", Some("mutated-elsewhere")),
        )]);

        let mut state = StackState::new("test", "dev");
        state.set_resource(ResourceState::new(
            "storage.account/main",
            "/providers/storage.account/main",
            &hash,
        ));

        let diff = engine.compute(&template(vec![storage]), Some(&state), &observed);
        assert_eq!(
            diff.diff_for("storage.account/main").unwrap().diff_type,
            DiffType::Drift
        );
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let engine = DiffEngine::new();

        let mut state = StackState::new("test", "dev");
        state.set_resource(ResourceState::new("ai.account/brain", "id-1", "h1"));

        let diff = engine.compute(&template(vec![]), Some(&state), &HashMap::new());
        assert_eq!(diff.deletes, 1);
        assert_eq!(
            diff.diff_for("ai.account/brain").unwrap().provider_id.as_deref(),
            Some("id-1")
        );
    }

    #[test]
    fn test_removed_existing_resource_is_not_deleted() {
        let engine = DiffEngine::new();

        let mut state = StackState::new("test", "dev");
        let mut record = ResourceState::new("network.subnet/workload", "id-1", "");
        record.existing = true;
        state.set_resource(record);

        let diff = engine.compute(&template(vec![]), Some(&state), &HashMap::new());
        assert_eq!(diff.deletes, 0);
    }

    #[test]
    fn test_existing_resource_resolves() {
        let engine = DiffEngine::new();
        let mut subnet = resource("network.subnet", "workload");
        subnet.existing = true;
        subnet.lookup_id = Some(String::from("/subscriptions/abc/subnets/workload"));

        let diff = engine.compute(&template(vec![subnet]), None, &HashMap::new());
        assert_eq!(diff.resolves, 1);
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_recorded_but_missing_on_provider_recreates() {
        let engine = DiffEngine::new();
        let storage = resource("storage.account", "main");

        let mut state = StackState::new("test", "dev");
        state.set_resource(ResourceState::new(
            "storage.account/main",
            "/providers/storage.account/main",
            "h1",
        ));

        let diff = engine.compute(&template(vec![storage]), Some(&state), &HashMap::new());
        assert_eq!(diff.creates, 1);
    }
}
