//! Error taxonomy for the login pipeline.
//!
//! Display strings are safe to hand to HTTP clients; anything richer goes
//! to the debug log at the point of failure.

use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum AuthError {
    /// Bad credentials, unavailable method, missing input, or a stale
    /// resume token.
    #[error("{0}")]
    AuthenticationFailed(String),

    /// The helper explicitly denied access for an authenticated identity.
    #[error("Permission denied")]
    PermissionDenied,

    /// Unparseable or non-UTF-8 helper output, malformed resume token.
    #[error("{0}")]
    InvalidData(String),

    /// Spawn failure, admission throttle, or other broker-side trouble.
    #[error("{0}")]
    InternalFailure(String),
}

impl AuthError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalFailure(message.into())
    }
}
