//! Template specification types for the provisioning system.
//!
//! This module defines all the structs that map to the `strata.deploy.yaml`
//! file. These types are declarative and fully describe the desired state of
//! a resource set; nothing here talks to the provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::reference::resource_references;

/// The root template structure for a strata deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateSet {
    /// Project-level configuration.
    pub project: ProjectSpec,
    /// Declared parameters, substituted before planning.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Resource declarations, in declaration order.
    pub resources: Vec<ResourceSpec>,
    /// Named values exposed after a successful apply.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSpec {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Provider region resources are created in.
    #[serde(default)]
    pub location: Option<String>,
    /// Per-resource apply timeout in seconds.
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    /// Maximum number of resources applied concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Tags stamped onto every resource the project creates.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A declared template parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSpec {
    /// Parameter name, referenced as `${param:<name>}`.
    pub name: String,
    /// Parameter type.
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    /// Default value used when the parameter is not supplied.
    #[serde(default)]
    pub default: Option<Value>,
    /// Minimum length constraint (string parameters).
    #[serde(default)]
    pub min_length: Option<usize>,
    /// Maximum length constraint (string parameters).
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Explicit set of allowed values.
    #[serde(default)]
    pub allowed: Vec<Value>,
}

/// Parameter types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// A string value.
    #[default]
    String,
    /// An integer value.
    Int,
    /// A boolean value.
    Bool,
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Resource type identifier (e.g., `storage.account`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name, unique per type within the template.
    pub name: String,
    /// Scope the resource is created under: another resource's address or an
    /// external provider identifier (leading `/`).
    #[serde(default)]
    pub scope: Option<String>,
    /// Parent resource address for nested declarations. Parent-before-child
    /// ordering is modeled as an ordinary reference edge.
    #[serde(default)]
    pub parent: Option<String>,
    /// Marks the resource as managed outside this plan. Existing resources
    /// are looked up, never created, mutated, or deleted.
    #[serde(default)]
    pub existing: bool,
    /// Provider identifier used to look up an existing resource.
    #[serde(default)]
    pub lookup_id: Option<String>,
    /// Target address for lock resources.
    #[serde(default)]
    pub target: Option<String>,
    /// Explicit dependencies by address.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Desired-state property bag. Values may be scalars, nested mappings,
    /// or sequences, and may contain `${address:attribute}` placeholders.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Classification of resource types that carry special apply semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// No special behavior.
    Standard,
    /// Management lock: refuses deletion of its target while applied.
    Lock,
    /// Role assignment: identity derived from (principal, role, scope).
    RoleAssignment,
    /// Private endpoint: satisfies network-restricted targets.
    PrivateEndpoint,
}

/// A named output sourced from an applied resource's attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSpec {
    /// Output name.
    pub name: String,
    /// Address of the resource the value is read from.
    pub resource: String,
    /// Attribute of the applied resource to expose.
    #[serde(default = "default_output_attribute")]
    pub attribute: String,
}

// Default value functions

const fn default_apply_timeout() -> u64 {
    120
}

const fn default_concurrency() -> usize {
    4
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_output_attribute() -> String {
    String::from("id")
}

impl TemplateSet {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns all resource addresses in declaration order.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.resources.iter().map(ResourceSpec::address).collect()
    }

    /// Looks up a resource by address.
    #[must_use]
    pub fn resource(&self, address: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.address() == address)
    }

    /// Returns the resources that are part of the mutation set (not marked
    /// existing).
    #[must_use]
    pub fn managed_resources(&self) -> Vec<&ResourceSpec> {
        self.resources.iter().filter(|r| !r.existing).collect()
    }
}

impl ResourceSpec {
    /// Returns the resource address, `type/name`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}/{}", self.resource_type, self.name)
    }

    /// Classifies the resource by its type identifier.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        if self.resource_type.starts_with("lock.") {
            ResourceKind::Lock
        } else if self.resource_type == "authorization.role_assignment" {
            ResourceKind::RoleAssignment
        } else if self.resource_type == "network.private_endpoint" {
            ResourceKind::PrivateEndpoint
        } else {
            ResourceKind::Standard
        }
    }

    /// Returns true if the resource disables public network access and
    /// therefore needs a private endpoint in the same plan to stay reachable.
    #[must_use]
    pub fn is_network_restricted(&self) -> bool {
        self.properties
            .get("public_network_access")
            .and_then(Value::as_str)
            .is_some_and(|v| v.eq_ignore_ascii_case("disabled"))
    }

    /// Collects every address this resource references: explicit
    /// `depends_on`, parent, address-form scope, lock target, and
    /// `${address:attribute}` placeholders inside property values.
    ///
    /// The result is deduplicated and preserves first-occurrence order.
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        let mut push = |addr: String| {
            if !refs.contains(&addr) {
                refs.push(addr);
            }
        };

        for dep in &self.depends_on {
            push(dep.clone());
        }
        if let Some(parent) = &self.parent {
            push(parent.clone());
        }
        if let Some(scope) = &self.scope
            && !scope.starts_with('/')
        {
            push(scope.clone());
        }
        if let Some(target) = &self.target {
            push(target.clone());
        }
        for value in self.properties.values() {
            for addr in resource_references(value) {
                push(addr);
            }
        }

        refs
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Bool => "bool",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Lock => "lock",
            Self::RoleAssignment => "role assignment",
            Self::PrivateEndpoint => "private endpoint",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_resource(resource_type: &str, name: &str) -> ResourceSpec {
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

    #[test]
    fn test_address_format() {
        let resource = minimal_resource("storage.account", "main");
        assert_eq!(resource.address(), "storage.account/main");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            minimal_resource("lock.deletion", "guard").kind(),
            ResourceKind::Lock
        );
        assert_eq!(
            minimal_resource("authorization.role_assignment", "reader").kind(),
            ResourceKind::RoleAssignment
        );
        assert_eq!(
            minimal_resource("network.private_endpoint", "pe").kind(),
            ResourceKind::PrivateEndpoint
        );
        assert_eq!(
            minimal_resource("ai.account", "brain").kind(),
            ResourceKind::Standard
        );
    }

    #[test]
    fn test_network_restriction_detection() {
        let mut resource = minimal_resource("storage.account", "main");
        assert!(!resource.is_network_restricted());

        resource
            .properties
            .insert(String::from("public_network_access"), json!("Disabled"));
        assert!(resource.is_network_restricted());

        resource
            .properties
            .insert(String::from("public_network_access"), json!("Enabled"));
        assert!(!resource.is_network_restricted());
    }

    #[test]
    fn test_references_collects_all_edge_sources() {
        let mut resource = minimal_resource("network.private_endpoint", "pe");
        resource.depends_on = vec![String::from("network.subnet/workload")];
        resource.parent = Some(String::from("network.vnet/main"));
        resource.scope = Some(String::from("resource.group/workload"));
        resource.properties.insert(
            String::from("target_id"),
            json!("${storage.account/main:id}"),
        );

        let refs = resource.references();
        assert_eq!(
            refs,
            vec![
                String::from("network.subnet/workload"),
                String::from("network.vnet/main"),
                String::from("resource.group/workload"),
                String::from("storage.account/main"),
            ]
        );
    }

    #[test]
    fn test_external_scope_is_not_a_reference() {
        let mut resource = minimal_resource("authorization.role_assignment", "reader");
        resource.scope = Some(String::from("/subscriptions/abc/resourceGroups/rg"));
        assert!(resource.references().is_empty());
    }

    #[test]
    fn test_references_deduplicates() {
        let mut resource = minimal_resource("lock.deletion", "guard");
        resource.target = Some(String::from("storage.account/main"));
        resource.depends_on = vec![String::from("storage.account/main")];
        assert_eq!(resource.references().len(), 1);
    }
}
