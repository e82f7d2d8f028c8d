//! Error types for the Micro operator

use thiserror::Error;

/// Main error type for Micro operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Invariant violation (e.g. a Deployment without a replica count,
    /// or a Micro without a UID when setting ownership)
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invariant-violation error with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a spec
    /// or code fix). Invariant violations retry: the offending object may be
    /// replaced by a well-formed one between invocations. Kubernetes errors
    /// depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => {
                // Retry on transient K8s errors (connection, timeout).
                // Don't retry on 4xx errors, except 409 conflicts which
                // resolve on re-reconcile with fresh state.
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation(_) => false,
            Error::Invariant(_) => true,
            Error::Serialization(_) => false,
        }
    }
}
