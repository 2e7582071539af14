//! Per-request errors and their HTTP mapping
//!
//! Body shape: `{"error":{"type":"...","message":"..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The refresh token was rejected; only new credentials can fix this.
    #[error("session is no longer valid")]
    SessionInvalid,

    /// Message already carries its context.
    #[error("{0}")]
    Refresh(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::SessionInvalid => StatusCode::UNAUTHORIZED,
            Error::Refresh(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::SessionInvalid => "session_invalid",
            Error::Refresh(_) => "refresh_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
