//! Session token management
//!
//! A [`Session`] holds one user's refresh token and a cached access token,
//! coalescing concurrent refreshes into a single request. [`HttpRefresher`]
//! performs the refresh against the auth server's token endpoint.

pub mod error;
pub mod http;
pub mod metrics;
pub mod refresher;
pub mod session;
pub mod tokens;

pub use error::{Error, Result};
pub use http::{HttpRefresher, RefreshClassification, TOKEN_PATH};
pub use refresher::{RefreshFuture, TokenRefresher};
pub use session::{MAX_MIN_UNTIL_EXPIRATION, Session, SessionState};
pub use tokens::{AccessToken, RefreshToken, Tokens};
