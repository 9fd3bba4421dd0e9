//! Provider control-plane boundary.
//!
//! The provider is an external collaborator: strata only depends on the
//! CRUD-style contract in [`api::ProviderApi`] and maps its HTTP surface to
//! the crate's error taxonomy. Resource-specific validation, billing, and
//! RBAC semantics stay on the provider side.

mod api;
mod http;
mod retry;

pub use api::{DesiredResource, ProviderApi, RemoteResource};
pub use http::HttpProvider;
pub use retry::{with_retries, DEFAULT_MAX_ATTEMPTS};

#[cfg(test)]
pub use api::MockProviderApi;
