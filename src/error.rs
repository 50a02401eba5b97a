//! Error types for the memcached operator
//!
//! Errors carry enough context (proxy name, field path, resource kind) to be
//! useful in events and logs. Whether a failed reconcile is retried is decided
//! by [`Error::is_retryable`].

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid MemcachedProxy spec
    #[error("validation error for {proxy}: {message}")]
    Validation {
        /// Key of the proxy with invalid configuration
        proxy: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.rules.children[0]")
        field: Option<String>,
    },

    /// Spec could not be canonically encoded for hashing
    #[error("fingerprint error: {message}")]
    Fingerprint {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A work queue key that is not `namespace/name`
    #[error("invalid object key '{key}'")]
    InvalidKey {
        /// The offending key
        key: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "dispatcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a field path, without proxy context
    pub fn validation_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            proxy: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Attach the proxy key to a validation error; other variants pass through
    pub fn for_proxy(self, key: impl Into<String>) -> Self {
        match self {
            Self::Validation { message, field, .. } => Self::Validation {
                proxy: key.into(),
                message,
                field,
            },
            other => other,
        }
    }

    /// Create a fingerprint error
    pub fn fingerprint(msg: impl Into<String>) -> Self {
        Self::Fingerprint {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether a reconcile that failed with this error should be requeued
    ///
    /// Configuration errors are terminal for the current generation: a later
    /// edit of the resource produces a new watch event and a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation { .. } | Self::InvalidKey { .. } => false,
            Self::Kube { .. }
            | Self::Fingerprint { .. }
            | Self::Serialization { .. }
            | Self::Internal { .. } => true,
        }
    }

    /// Field path for validation errors
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
