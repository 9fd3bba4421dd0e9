//! Provider API trait and exchange types.
//!
//! This is the seam the executor talks through: a create-or-update `put`, a
//! read-back `get`, and a `delete`, all keyed by resource address with
//! provider-assigned identifiers flowing back. Diagnostic settings and role
//! assignments follow the same create-or-update contract as everything else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;

/// Desired state submitted to the provider for one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredResource {
    /// Resource address (`type/name`).
    pub address: String,
    /// Resource type identifier.
    pub resource_type: String,
    /// Resource name.
    pub name: String,
    /// Resolved scope identifier, if any.
    pub scope: Option<String>,
    /// Fully resolved property bag (no placeholders remain).
    pub properties: Value,
    /// Canonical hash of the declaration, recorded as provider metadata so
    /// read-backs can detect convergence without comparing full bags.
    pub spec_hash: String,
}

/// A resource as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteResource {
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Resource address the object was created under.
    pub address: String,
    /// Spec hash recorded at last apply, if the object was created by strata.
    #[serde(default)]
    pub spec_hash: Option<String>,
    /// Resulting attributes (always includes `id`).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Provider-side provisioning state, if reported.
    #[serde(default)]
    pub provisioning_state: Option<String>,
}

impl RemoteResource {
    /// Renders an attribute as a string, unquoting string values.
    #[must_use]
    pub fn attribute_str(&self, name: &str) -> Option<String> {
        if name == "id" {
            return Some(self.provider_id.clone());
        }
        self.attributes.get(name).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// CRUD-style contract against the provider control plane.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Reads back the resource at an address.
    ///
    /// Returns `None` if the provider has no object for the address.
    async fn get(&self, address: &str) -> Result<Option<RemoteResource>>;

    /// Looks up a resource by provider-assigned identifier. Used for
    /// existing-resource references managed outside the plan.
    async fn get_by_id(&self, provider_id: &str) -> Result<Option<RemoteResource>>;

    /// Submits desired state, creating or updating the resource.
    async fn put(&self, desired: &DesiredResource) -> Result<RemoteResource>;

    /// Deletes the resource at an address.
    async fn delete(&self, address: &str, provider_id: &str) -> Result<()>;
}
