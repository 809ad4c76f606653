//! Canonical tagged error kinds used across the gateway, instead of string
//! matching at the call site.

use thiserror::Error;

/// The closed set of error kinds a gateway component can surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("network error: {0}")]
    NetworkError(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

impl GatewayError {
    /// Whether this error should be logged-and-continued at the owning
    /// loop, as opposed to tearing down the connection/tunnel it occurred on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout | GatewayError::ResourceExhausted(_)
        )
    }
}
