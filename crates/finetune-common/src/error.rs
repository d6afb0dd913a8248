//! Error types for the finetune operator
//!
//! Errors carry the TrainingJob or resource they concern so a log line or a
//! status message is enough to find the object at fault.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for finetune operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error (transient store error unless the API said otherwise)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Missing or invalid user input on a TrainingJob
    #[error("validation error for {job}: {message}")]
    Validation {
        /// Name of the TrainingJob with invalid configuration
        job: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.huggingFaceSecret")
        field: Option<String>,
    },

    /// A dependent resource could not be stamped with, or is held by another, owner
    #[error("ownership error for {kind} {name}: {message}")]
    Ownership {
        /// Kind of the dependent resource
        kind: String,
        /// Name of the dependent resource
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// A dependent resource stayed terminating past the deletion deadline
    #[error("{kind} {name} still terminating after {waited_secs}s")]
    DeletionStuck {
        /// Kind of the dependent resource
        kind: String,
        /// Name of the dependent resource
        name: String,
        /// Seconds since the deletion was requested
        waited_secs: u64,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "store")
        context: String,
    },
}

impl Error {
    /// Create a validation error with TrainingJob context
    pub fn validation_for(job: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            job: job.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with TrainingJob context and field path
    pub fn validation_for_field(
        job: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            job: job.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an ownership error for a dependent resource
    pub fn ownership(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Ownership {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a stuck-deletion error
    pub fn deletion_stuck(kind: impl Into<String>, name: impl Into<String>, waited: Duration) -> Self {
        Self::DeletionStuck {
            kind: kind.into(),
            name: name.into(),
            waited_secs: waited.as_secs(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
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
    /// Validation and serialization errors need a spec or code change.
    /// Kubernetes 4xx errors are permanent except conflicts and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Ownership { .. } => true,
            Error::DeletionStuck { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the API reported the object as absent (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when the API rejected a write because the object changed (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Short label for the error category, used as a metric attribute
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Kube { .. } if self.is_conflict() => "conflict",
            Error::Kube { .. } => "kube",
            Error::Validation { .. } => "validation",
            Error::Ownership { .. } => "ownership",
            Error::DeletionStuck { .. } => "deletion_stuck",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}
