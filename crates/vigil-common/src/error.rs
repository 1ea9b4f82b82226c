//! Error types for the Vigil operator
//!
//! Errors are structured with fields so a failed reconciliation cycle can be
//! traced back to the object or input that caused it. Variants map onto the
//! handling categories of the reconcile loop: configuration problems wait for
//! an upstream change, transient I/O and conflicts are retried on the next
//! cycle, and serialization failures are bugs.

use thiserror::Error;

/// Main error type for Vigil operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed or missing required input (credential document, secret key)
    #[error("configuration error for {resource}: {message}")]
    Configuration {
        /// The object holding the bad input (e.g., "tenant/agent-pull-secret")
        resource: String,
        /// Description of what's wrong
        message: String,
    },

    /// A referenced object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespace that was searched
        namespace: String,
        /// Name of the missing object
        name: String,
    },

    /// Image version could not be resolved from the registry
    #[error("failed to resolve image {image}: {message}")]
    Resolution {
        /// The image reference being resolved
        image: String,
        /// Description of what failed
        message: String,
    },

    /// The store rejected a write because the object changed concurrently
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
        /// Message returned by the store
        message: String,
    },

    /// Caller contract violation (e.g., an agent without a name)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "metadata.namespace")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "sync", "controller")
        context: String,
    },
}

impl Error {
    /// Create a configuration error for the given resource
    pub fn configuration(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a namespaced object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a resolution error for an image reference
    pub fn resolution(image: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            image: image.into(),
            message: msg.into(),
        }
    }

    /// Create a write-conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
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

    /// Check if this error is retryable
    ///
    /// Configuration, validation and serialization errors need a fix upstream
    /// (or in code) before another attempt can succeed. Everything else may
    /// clear up on the next cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout, conflict)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Configuration { .. } => false,
            Error::NotFound { .. } => true,
            Error::Resolution { .. } => true,
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
