//! Pre-flight validation of resolved template sets.
//!
//! Everything here runs before any provider call: structural checks on
//! resource declarations, lock and existing-resource rules, and reachability
//! warnings for network-restricted resources.

use std::collections::HashSet;
use tracing::debug;

use crate::error::{Result, StrataError, TemplateError};

use super::reference::extract_placeholders;
use super::spec::{ResourceKind, ResourceSpec, TemplateSet};

/// Validator for resolved template sets.
#[derive(Debug, Default)]
pub struct TemplateValidator;

/// Validation result containing all issues found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationIssue>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationIssue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl TemplateValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a resolved template set.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation error is found; warnings alone do
    /// not fail validation.
    pub fn validate(&self, template: &TemplateSet) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&template.project, &mut result);
        Self::validate_resources(&template.resources, &mut result);
        Self::validate_outputs(template, &mut result);
        Self::check_network_restrictions(template, &mut result);

        if result.errors.is_empty() {
            debug!(
                "Template validation passed ({} warnings)",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first = &result.errors[0];
            Err(StrataError::Template(TemplateError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }))
        }
    }

    /// Validates the project block.
    fn validate_project(project: &super::spec::ProjectSpec, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationIssue {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationIssue {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationIssue {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }

        if project.concurrency == 0 {
            result.errors.push(ValidationIssue {
                field: String::from("project.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(resources: &[ResourceSpec], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared in template"));
            return;
        }

        let mut seen_addresses = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let address = resource.address();

            if !seen_addresses.insert(address.clone()) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource address: {address}"),
                });
            }

            if !is_valid_type(&resource.resource_type) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.type"),
                    message: format!(
                        "Resource type '{}' is invalid. Must be lowercase dot-separated segments.",
                        resource.resource_type
                    ),
                });
            }

            if resource.name.is_empty() {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.name"),
                    message: String::from("Resource name cannot be empty"),
                });
            }

            Self::validate_lifecycle(resource, &prefix, result);
            Self::validate_kind_rules(resource, &prefix, result);
            Self::validate_placeholders(resource, &prefix, result);
        }
    }

    /// Validates existing-resource rules.
    fn validate_lifecycle(resource: &ResourceSpec, prefix: &str, result: &mut ValidationResult) {
        if resource.existing {
            if resource.lookup_id.as_deref().is_none_or(str::is_empty) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.lookup_id"),
                    message: format!(
                        "Existing resource '{}' requires a lookup_id",
                        resource.address()
                    ),
                });
            }
            if !resource.properties.is_empty() {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.properties"),
                    message: format!(
                        "Existing resource '{}' is read-only and cannot declare properties",
                        resource.address()
                    ),
                });
            }
        } else if resource.lookup_id.is_some() {
            result.errors.push(ValidationIssue {
                field: format!("{prefix}.lookup_id"),
                message: String::from("lookup_id is only valid on existing resources"),
            });
        }
    }

    /// Validates rules tied to the resource kind.
    fn validate_kind_rules(resource: &ResourceSpec, prefix: &str, result: &mut ValidationResult) {
        match resource.kind() {
            ResourceKind::Lock => {
                if resource.target.as_deref().is_none_or(str::is_empty) {
                    result.errors.push(ValidationIssue {
                        field: format!("{prefix}.target"),
                        message: format!(
                            "Lock resource '{}' requires a target address",
                            resource.address()
                        ),
                    });
                }
            }
            ResourceKind::RoleAssignment => {
                for required in ["principal_id", "role"] {
                    if !resource.properties.contains_key(required) {
                        result.errors.push(ValidationIssue {
                            field: format!("{prefix}.properties.{required}"),
                            message: format!(
                                "Role assignment '{}' requires property '{required}'",
                                resource.address()
                            ),
                        });
                    }
                }
            }
            ResourceKind::Standard | ResourceKind::PrivateEndpoint => {
                if resource.target.is_some() {
                    result.errors.push(ValidationIssue {
                        field: format!("{prefix}.target"),
                        message: String::from("target is only valid on lock resources"),
                    });
                }
            }
        }
    }

    /// Validates placeholder syntax inside property values and rejects
    /// unresolved parameters.
    fn validate_placeholders(resource: &ResourceSpec, prefix: &str, result: &mut ValidationResult) {
        for (key, value) in &resource.properties {
            for text in string_values(value) {
                if text.contains("${param:") {
                    result.errors.push(ValidationIssue {
                        field: format!("{prefix}.properties.{key}"),
                        message: format!("Unresolved parameter placeholder in '{text}'"),
                    });
                } else if let Err(e) = extract_placeholders(&text) {
                    result.errors.push(ValidationIssue {
                        field: format!("{prefix}.properties.{key}"),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Validates output declarations.
    fn validate_outputs(template: &TemplateSet, result: &mut ValidationResult) {
        let addresses: HashSet<String> = template.addresses().into_iter().collect();
        let mut seen_names = HashSet::new();

        for (i, output) in template.outputs.iter().enumerate() {
            let prefix = format!("outputs[{i}]");

            if !seen_names.insert(&output.name) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate output name: {}", output.name),
                });
            }

            if !addresses.contains(&output.resource) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.resource"),
                    message: format!(
                        "Output '{}' references unknown resource '{}'",
                        output.name, output.resource
                    ),
                });
            }

            if output.attribute.is_empty() {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.attribute"),
                    message: String::from("Output attribute cannot be empty"),
                });
            }
        }
    }

    /// Warns about network-restricted resources with no private endpoint in
    /// the same plan: applying them succeeds but leaves them unreachable.
    fn check_network_restrictions(template: &TemplateSet, result: &mut ValidationResult) {
        let endpoint_targets: HashSet<String> = template
            .resources
            .iter()
            .filter(|r| r.kind() == ResourceKind::PrivateEndpoint)
            .flat_map(ResourceSpec::references)
            .collect();

        for resource in &template.resources {
            if resource.existing || !resource.is_network_restricted() {
                continue;
            }
            let address = resource.address();
            if !endpoint_targets.contains(&address) {
                result.warnings.push(format!(
                    "Resource '{address}' disables public network access but no private \
                     endpoint in this plan targets it; it will be unreachable after apply"
                ));
            }
        }
    }
}

/// Returns every string scalar inside a property value.
fn string_values(value: &serde_json::Value) -> Vec<String> {
    let mut strings = Vec::new();
    collect_strings(value, &mut strings);
    strings
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {}
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    if name.ends_with('-') || name.contains("--") {
        return false;
    }

    true
}

/// Validates a resource type identifier: lowercase dot-separated segments,
/// underscores allowed within a segment.
fn is_valid_type(resource_type: &str) -> bool {
    if resource_type.is_empty() {
        return false;
    }

    resource_type.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    })
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::spec::{ProjectSpec, ResourceSpec};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn project(name: &str) -> ProjectSpec {
        ProjectSpec {
            name: name.to_string(),
            environment: String::from("dev"),
            location: None,
            apply_timeout_secs: 120,
            concurrency: 4,
            tags: BTreeMap::new(),
        }
    }

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
            project: project("test"),
            parameters: vec![],
            resources,
            outputs: vec![],
        }
    }

    #[test]
    fn test_valid_template_passes() {
        let validator = TemplateValidator::new();
        let result = validator
            .validate(&template(vec![resource("storage.account", "main")]))
            .unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let validator = TemplateValidator::new();
        let result = validator.validate(&template(vec![
            resource("storage.account", "main"),
            resource("storage.account", "main"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_existing_resource_with_properties_rejected() {
        let mut existing = resource("network.subnet", "workload");
        existing.existing = true;
        existing.lookup_id = Some(String::from("/subscriptions/abc/subnets/workload"));
        existing
            .properties
            .insert(String::from("cidr"), json!("10.0.0.0/24"));

        let validator = TemplateValidator::new();
        assert!(validator.validate(&template(vec![existing])).is_err());
    }

    #[test]
    fn test_existing_resource_requires_lookup_id() {
        let mut existing = resource("network.subnet", "workload");
        existing.existing = true;

        let validator = TemplateValidator::new();
        assert!(validator.validate(&template(vec![existing])).is_err());
    }

    #[test]
    fn test_lock_requires_target() {
        let lock = resource("lock.deletion", "guard");
        let validator = TemplateValidator::new();
        assert!(validator.validate(&template(vec![lock])).is_err());
    }

    #[test]
    fn test_role_assignment_requires_principal_and_role() {
        let assignment = resource("authorization.role_assignment", "reader");
        let validator = TemplateValidator::new();
        assert!(validator.validate(&template(vec![assignment])).is_err());
    }

    #[test]
    fn test_network_restricted_without_endpoint_warns() {
        let mut storage = resource("storage.account", "main");
        storage
            .properties
            .insert(String::from("public_network_access"), json!("Disabled"));

        let validator = TemplateValidator::new();
        let result = validator.validate(&template(vec![storage])).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("storage.account/main"));
    }

    #[test]
    fn test_network_restricted_with_endpoint_does_not_warn() {
        let mut storage = resource("storage.account", "main");
        storage
            .properties
            .insert(String::from("public_network_access"), json!("Disabled"));

        let mut endpoint = resource("network.private_endpoint", "storage-pe");
        endpoint.properties.insert(
            String::from("target_id"),
            json!("${storage.account/main:id}"),
        );

        let validator = TemplateValidator::new();
        let result = validator.validate(&template(vec![storage, endpoint])).unwrap();
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_output_referencing_unknown_resource_rejected() {
        let mut set = template(vec![resource("storage.account", "main")]);
        set.outputs.push(crate::template::spec::OutputSpec {
            name: String::from("missing_id"),
            resource: String::from("storage.account/missing"),
            attribute: String::from("id"),
        });

        let validator = TemplateValidator::new();
        assert!(validator.validate(&set).is_err());
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("ai-workload"));
        assert!(is_valid_name("a"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Workload"));
        assert!(!is_valid_name("workload-"));
        assert!(!is_valid_name("work--load"));
    }

    #[test]
    fn test_valid_type() {
        assert!(is_valid_type("storage.account"));
        assert!(is_valid_type("authorization.role_assignment"));
        assert!(!is_valid_type("Storage.Account"));
        assert!(!is_valid_type("storage..account"));
        assert!(!is_valid_type(""));
    }
}
