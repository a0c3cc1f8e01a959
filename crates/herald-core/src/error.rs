//! Gateway errors and their wire codes.

use crate::collaborators::{AuthError, CollaboratorError};
use crate::store::StoreError;
use herald_protocol::{ErrorCode, ProtocolError, ServerEvent};
use thiserror::Error;

/// Errors raised while handling a connection or one of its events.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The credential is missing or invalid.
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The user may not perform this action.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Too many connections or events.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// A backing service could not be reached.
    #[error("Service unavailable: {0}")]
    StoreUnavailable(String),

    /// The event is malformed.
    #[error("Malformed event: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// Stable wire error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Authentication(_) => ErrorCode::Unauthenticated,
            GatewayError::Authorization(_) => ErrorCode::Forbidden,
            GatewayError::RateLimited => ErrorCode::RateLimited,
            GatewayError::StoreUnavailable(_) => ErrorCode::Unavailable,
            GatewayError::Malformed(_) => ErrorCode::Malformed,
        }
    }

    /// The `error` event reported to the client.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.code(), self.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::StoreUnavailable(e.to_string())
    }
}

impl From<CollaboratorError> for GatewayError {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::Unavailable(reason) => GatewayError::StoreUnavailable(reason),
            CollaboratorError::Rejected(reason) => GatewayError::Authorization(reason),
        }
    }
}

impl From<ProtocolError> for GatewayError {
    fn from(e: ProtocolError) -> Self {
        GatewayError::Malformed(e.to_string())
    }
}
