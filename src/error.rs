//! Error types for the strata provisioning system.
//!
//! This module provides a comprehensive error hierarchy for all operations
//! in the provisioning lifecycle: template handling, graph construction,
//! provider API calls, planning, applying, and state management.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the strata provisioning system.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Template-related errors.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Apply-phase errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Template-related errors, caught before any provider call.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template file was not found.
    #[error("Template file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The template file could not be parsed.
    #[error("Failed to parse template: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Template validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A required parameter was not supplied.
    #[error("Missing parameter: {name}")]
    MissingParameter {
        /// Name of the missing parameter.
        name: String,
    },

    /// A supplied parameter violates its declared constraints.
    #[error("Parameter '{name}' violates constraint: {constraint}")]
    ParameterConstraint {
        /// Name of the parameter.
        name: String,
        /// The constraint that was violated.
        constraint: String,
    },

    /// A required environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource address.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// A reference placeholder is syntactically invalid.
    #[error("Invalid reference syntax: {placeholder}")]
    InvalidReference {
        /// The offending placeholder text.
        placeholder: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The reference graph contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    CycleDetected {
        /// Description of the cycle members.
        cycle: String,
    },

    /// A reference points to a resource not present in the plan.
    #[error("Resource '{from}' references unknown resource '{to}'")]
    UnresolvedReference {
        /// Address of the referencing resource.
        from: String,
        /// Address of the missing dependency.
        to: String,
    },

    /// A resource references itself.
    #[error("Resource '{address}' references itself")]
    SelfReference {
        /// Address of the resource.
        address: String,
    },
}

/// Provider API errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Authorization failed. Fatal, never retried.
    #[error("Provider authorization denied: {message}")]
    AuthorizationDenied {
        /// Description of the auth failure.
        message: String,
    },

    /// Quota exhausted. Fatal, never retried.
    #[error("Provider quota exceeded: {message}")]
    QuotaExceeded {
        /// Description of the quota issue.
        message: String,
    },

    /// The provider reported a state conflict. Fatal, never retried.
    #[error("Provider conflict on '{address}': {message}")]
    Conflict {
        /// Address of the conflicting resource.
        address: String,
        /// Description of the conflict.
        message: String,
    },

    /// The submitted desired state was rejected as malformed. Fatal.
    #[error("Provider rejected desired state for '{address}': {message}")]
    MalformedState {
        /// Address of the rejected resource.
        address: String,
        /// Description of the rejection.
        message: String,
    },

    /// The provider throttled the request. Transient.
    #[error("Provider throttled the request, retry after {retry_after_secs} seconds")]
    Throttled {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network-level failure talking to the provider. Transient.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// A per-resource apply call timed out. Transient.
    #[error("Timed out waiting for provider operation on '{address}'")]
    Timeout {
        /// Address of the resource being applied.
        address: String,
    },

    /// The requested resource does not exist on the provider.
    #[error("Resource not found on provider: {address}")]
    NotFound {
        /// Address of the missing resource.
        address: String,
    },

    /// API request failed with a status the client does not special-case.
    #[error("Provider API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// Invalid response from the API.
    #[error("Invalid response from provider API: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Apply-phase errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A mutation was attempted on a resource protected by a lock.
    #[error("Resource '{address}' is protected by lock '{lock}' and cannot be deleted")]
    LockedResource {
        /// Address of the protected resource.
        address: String,
        /// Address of the lock resource protecting it.
        lock: String,
    },

    /// An action was skipped because a dependency failed.
    #[error("Resource '{address}' skipped: dependency '{dependency}' failed")]
    DependencyFailed {
        /// Address of the skipped resource.
        address: String,
        /// Address of the failed dependency.
        dependency: String,
    },

    /// Maximum retry attempts exceeded for a resource.
    #[error("Maximum retry attempts ({attempts}) exceeded for '{address}'")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Address of the resource that kept failing.
        address: String,
    },

    /// The apply run was aborted.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for the abort.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Backend IO error.
    #[error("State backend error: {message}")]
    BackendError {
        /// Description of the backend error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    ///
    /// Only transient provider failures and state lock contention qualify;
    /// authorization, quota, conflict, and malformed-state errors never do.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(
                ProviderError::Throttled { .. }
                    | ProviderError::Network { .. }
                    | ProviderError::Timeout { .. }
            ) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Throttled { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Provider(ProviderError::Network { .. } | ProviderError::Timeout { .. }) => {
                Some(5)
            }
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns the stable machine-readable kind string for this error.
    ///
    /// These strings appear in the structured failure list emitted on exit
    /// and must not change between releases.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Template(_) => "validation",
            Self::Graph(GraphError::CycleDetected { .. }) => "cycle",
            Self::Graph(_) => "reference_resolution",
            Self::Provider(
                ProviderError::Throttled { .. }
                    | ProviderError::Network { .. }
                    | ProviderError::Timeout { .. },
            ) => "provider_transient",
            Self::Provider(_) => "provider_fatal",
            Self::Apply(ApplyError::LockedResource { .. }) => "locked_resource",
            Self::Apply(ApplyError::DependencyFailed { .. }) => "dependency_failed",
            Self::Apply(_) => "apply",
            Self::State(_) => "state",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

impl TemplateError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}
