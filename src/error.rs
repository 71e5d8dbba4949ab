//! Error types for the Hive provisioner
//!
//! Errors are structured with fields so that a failure surfaced to the HTTP
//! layer (or a log line) names the environment, the resource kind, and the
//! route involved. No failure path only logs: every one of them returns one of
//! these variants.

use std::time::Duration;

use thiserror::Error;

use crate::store::ResourceKind;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// A single sub-resource that could not be removed during environment teardown
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteFailure {
    /// Which sub-resource failed
    pub kind: ResourceKind,
    /// Why it failed
    pub message: String,
}

/// Main error type for Hive operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed environment identity, descriptor, or configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field (e.g., "student")
        field: Option<String>,
    },

    /// A cluster resource could not be created
    #[error("failed to create {kind} resource {name}: {message}")]
    ResourceCreateFailed {
        /// Which resource failed
        kind: ResourceKind,
        /// Deterministic handle of the resource
        name: String,
        /// Underlying cause
        message: String,
    },

    /// A cluster resource does not exist
    #[error("{kind} resource {name} not found")]
    ResourceNotFound {
        /// Which resource was looked up
        kind: ResourceKind,
        /// Deterministic handle of the resource
        name: String,
    },

    /// The environment's handle is already held in the cluster
    #[error("resource {name} is already held by {owner}")]
    Conflict {
        /// Deterministic handle of the environment
        name: String,
        /// Who holds it
        owner: String,
    },

    /// Route key or backend address failed shape validation
    #[error("invalid route {key} -> {backend}: {message}")]
    InvalidRoute {
        /// Route key as supplied
        key: String,
        /// Backend address as supplied
        backend: String,
        /// What is wrong with it
        message: String,
    },

    /// The routing resource could not be updated after a table mutation
    #[error("failed to apply routing config version {version}: {message}")]
    ApplyFailed {
        /// Table version whose rendering failed to apply
        version: u64,
        /// Underlying cause
        message: String,
    },

    /// Environment resources exist but the route could not be registered
    #[error("failed to register route {key}: {source}")]
    RouteRegistrationFailed {
        /// Route key of the environment
        key: String,
        /// Why registration failed (address wait or apply)
        #[source]
        source: Box<Error>,
    },

    /// Environment teardown left some sub-resources behind
    #[error("failed to delete {} of environment {name}", failed_kind_list(.failures))]
    PartialDeleteFailure {
        /// Environment resource handle
        name: String,
        /// Every sub-resource that could not be removed
        failures: Vec<DeleteFailure>,
    },

    /// No address was assigned within the deadline
    #[error("timed out after {waited:?} waiting for an address on {name}")]
    Timeout {
        /// Network endpoint being polled
        name: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// The caller cancelled a wait before it completed
    #[error("wait for an address on {name} was cancelled")]
    Cancelled {
        /// Network endpoint being polled
        name: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "connect", "serve")
        context: String,
    },
}

fn failed_kind_list(failures: &[DeleteFailure]) -> String {
    failures
        .iter()
        .map(|f| f.kind.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap a store failure as a creation failure for the given resource
    pub fn resource_create_failed(
        kind: ResourceKind,
        name: impl Into<String>,
        cause: &Error,
    ) -> Self {
        Self::ResourceCreateFailed {
            kind,
            name: name.into(),
            message: cause.to_string(),
        }
    }

    /// Create a not-found error for the given resource
    pub fn resource_not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create an invalid-route error
    pub fn invalid_route(
        key: impl Into<String>,
        backend: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidRoute {
            key: key.into(),
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create a conflict error for a handle held by someone else
    pub fn conflict(name: impl Into<String>, owner: impl ToString) -> Self {
        Self::Conflict {
            name: name.into(),
            owner: owner.to_string(),
        }
    }

    /// True for "resource not found", which delete paths treat as success
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }

    /// Sub-resources named by a [`Error::PartialDeleteFailure`], empty otherwise
    pub fn failed_kinds(&self) -> Vec<ResourceKind> {
        match self {
            Self::PartialDeleteFailure { failures, .. } => {
                failures.iter().map(|f| f.kind).collect()
            }
            _ => Vec::new(),
        }
    }
}
