//! Error types for gantry operations

use thiserror::Error;

/// Main error type for cluster provisioning operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Compute provider error (VM create/get/delete)
    #[error("compute error: {0}")]
    Compute(String),

    /// Cloud load balancer error
    #[error("load balancer error: {0}")]
    LoadBalancer(String),

    /// Remote command execution error
    #[error("remote execution error: {0}")]
    Remote(String),

    /// Join-credential extraction error (expected pattern not found)
    #[error("credential extraction error: {0}")]
    Extraction(String),

    /// Persistence error
    #[error("store error: {0}")]
    Store(String),

    /// Record not found in the store
    #[error("not found: {0}")]
    NotFound(String),

    /// Validation error for cluster requests
    #[error("validation error: {0}")]
    Validation(String),

    /// A bounded wait expired before the resource became ready
    #[error("timed out: {0}")]
    Timeout(String),

    /// Another operation already owns this cluster
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation was canceled by the operator
    #[error("canceled: {0}")]
    Canceled(String),
}

impl Error {
    /// Create a compute error with the given message
    pub fn compute(msg: impl Into<String>) -> Self {
        Self::Compute(msg.into())
    }

    /// Create a load balancer error with the given message
    pub fn load_balancer(msg: impl Into<String>) -> Self {
        Self::LoadBalancer(msg.into())
    }

    /// Create a remote execution error with the given message
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create an extraction error with the given message
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("record not found".to_string()),
            other => Error::Store(other.to_string()),
        }
    }
}
