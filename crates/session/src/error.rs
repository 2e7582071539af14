//! Error types for session operations
//!
//! `Clone` so one refresh outcome can be handed to every coalesced caller.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid {kind} token: {reason}")]
    InvalidToken { kind: &'static str, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("token refresh failed: {0}")]
    Refresh(#[from] async_state::Error),

    #[error(
        "required access token expiry {0:?} is too long; access tokens are too short-lived to be used for more than 60s"
    )]
    ExpiryTooLong(Duration),

    #[error(
        "required access token expiry {required:?} is too long; freshly issued access tokens expire in {actual:?}"
    )]
    TokenTooShortLived { required: Duration, actual: Duration },
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
