//! Deterministic spec hashing for change detection.
//!
//! This module provides canonical hashing of resource declarations to detect
//! changes between runs and enable idempotent applies, plus the deterministic
//! naming scheme that keeps role assignments from duplicating on re-apply.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::spec::{ResourceSpec, TemplateSet};

/// Hasher for computing resource and template hashes.
#[derive(Debug, Default)]
pub struct SpecHasher;

impl SpecHasher {
    /// Creates a new spec hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire template set.
    ///
    /// This hash changes when any resource, the project block, or an output
    /// changes, and is recorded in state after a successful apply.
    #[must_use]
    pub fn hash_template(&self, template: &TemplateSet) -> String {
        let mut hasher = Sha256::new();

        hasher.update(template.project.name.as_bytes());
        hasher.update(template.project.environment.as_bytes());
        if let Some(location) = &template.project.location {
            hasher.update(location.as_bytes());
        }

        for resource in &template.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        for output in &template.outputs {
            hasher.update(output.name.as_bytes());
            hasher.update(output.resource.as_bytes());
            hasher.update(output.attribute.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the canonical hash of a single resource declaration.
    ///
    /// Property maps are `BTreeMap`s and nested objects serialize with
    /// sorted keys, so the hash is stable regardless of authoring order.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(resource.name.as_bytes());
        hasher.update([0u8]);

        if let Some(scope) = &resource.scope {
            hasher.update(scope.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(parent) = &resource.parent {
            hasher.update(parent.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(target) = &resource.target {
            hasher.update(target.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(if resource.existing { [1u8] } else { [0u8] });

        for (key, value) in &resource.properties {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hash_value(&mut hasher, value);
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Derives the deterministic name for a role assignment from its
    /// (principal, role, scope) tuple.
    ///
    /// The same tuple always yields the same UUID-shaped name, so a
    /// re-applied assignment upserts the existing binding instead of
    /// creating a duplicate.
    #[must_use]
    pub fn role_assignment_name(principal: &str, role: &str, scope: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(principal.as_bytes());
        hasher.update([0u8]);
        hasher.update(role.as_bytes());
        hasher.update([0u8]);
        hasher.update(scope.as_bytes());

        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes).to_string()
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Hashes a property value with an unambiguous type prefix per variant.
fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update(if *b { [1u8] } else { [0u8] });
        }
        Value::Number(n) => {
            hasher.update(b"i");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"a");
            for item in items {
                hash_value(hasher, item);
                hasher.update([0u8]);
            }
        }
        Value::Object(map) => {
            hasher.update(b"o");
            for (key, item) in map {
                hasher.update(key.as_bytes());
                hasher.update([0u8]);
                hash_value(hasher, item);
                hasher.update([0u8]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn test_resource(name: &str) -> ResourceSpec {
        ResourceSpec {
            resource_type: String::from("storage.account"),
            name: name.to_string(),
            scope: None,
            parent: None,
            existing: false,
            lookup_id: None,
            target: None,
            depends_on: vec![],
            properties: BTreeMap::from([
                (String::from("sku"), json!("Standard_LRS")),
                (String::from("kind"), json!("StorageV2")),
            ]),
        }
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = SpecHasher::new();
        let resource = test_resource("main");

        assert_eq!(hasher.hash_resource(&resource), hasher.hash_resource(&resource));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = SpecHasher::new();
        assert_ne!(
            hasher.hash_resource(&test_resource("main")),
            hasher.hash_resource(&test_resource("backup"))
        );
    }

    #[test]
    fn test_property_change_changes_hash() {
        let hasher = SpecHasher::new();
        let before = test_resource("main");
        let mut after = before.clone();
        after
            .properties
            .insert(String::from("sku"), json!("Premium_LRS"));

        assert_ne!(hasher.hash_resource(&before), hasher.hash_resource(&after));
    }

    #[test]
    fn test_role_assignment_name_is_stable() {
        let a = SpecHasher::role_assignment_name(
            "principal-1",
            "StorageBlobDataReader",
            "/subscriptions/abc/storage/main",
        );
        let b = SpecHasher::role_assignment_name(
            "principal-1",
            "StorageBlobDataReader",
            "/subscriptions/abc/storage/main",
        );
        assert_eq!(a, b);

        // Parseable as a UUID.
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_role_assignment_name_distinguishes_tuples() {
        let reader = SpecHasher::role_assignment_name("p", "Reader", "/scope");
        let writer = SpecHasher::role_assignment_name("p", "Writer", "/scope");
        assert_ne!(reader, writer);
    }

    #[test]
    fn test_short_hash() {
        let hasher = SpecHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(SpecHasher::hashes_match("abc123", "abc123"));
        assert!(!SpecHasher::hashes_match("abc123", "abc124"));
        assert!(!SpecHasher::hashes_match("abc123", "abc12"));
    }
}
