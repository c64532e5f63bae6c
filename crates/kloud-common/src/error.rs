//! Error types for the kloud reconciliation engine
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the resource it concerns where one is known, so that
//! the controller error policy can log and requeue with useful context.

use std::time::Duration;

use thiserror::Error;

use crate::template::TemplateError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kloud operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.routes[0].app")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Template rendering failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Backing database command failed
    #[error("database error for {resource}: {message}")]
    Database {
        /// Resource whose database work failed
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Status notification could not be published
    #[error("notification error: {message}")]
    Notification {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "apply", "finalizer", "job-tracker")
        context: String,
    },

    /// An error that must be retried after a specific delay
    #[error("{source} (retry in {after:?})")]
    RetryAfter {
        /// Delay before the next reconcile attempt
        after: Duration,
        /// The underlying error
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a database error for a resource
    pub fn database_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Database {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a notification error
    pub fn notification(msg: impl Into<String>) -> Self {
        Self::Notification {
            message: msg.into(),
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

    /// Attach an explicit retry delay to this error
    pub fn retry_after(self, after: Duration) -> Self {
        match self {
            Error::RetryAfter { source, .. } => Error::RetryAfter { after, source },
            other => Error::RetryAfter {
                after,
                source: Box::new(other),
            },
        }
    }

    /// The explicit retry delay, if one was attached
    pub fn requeue_hint(&self) -> Option<Duration> {
        match self {
            Error::RetryAfter { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require a spec fix and are not
    /// retried. Conflicts and transient API failures are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Template(_) => false,
            Error::Database { .. } => true,
            Error::Notification { .. } => true,
            Error::Internal { .. } => true,
            Error::RetryAfter { .. } => true,
        }
    }

    /// Whether the underlying API error is a 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::RetryAfter { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the underlying API error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            Error::RetryAfter { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Database { resource, .. } => Some(resource),
            Error::RetryAfter { source, .. } => source.resource(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("api error {code}"),
        reason: match code {
            404 => "NotFound",
            409 => "Conflict",
            _ => "InternalError",
        }
        .to_string(),
        code,
    })
}
