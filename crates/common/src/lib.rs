//! Shared building blocks for the token broker workspace
//!
//! - [`Secret`]: redacting, zeroize-on-drop wrapper for tokens and client keys
//! - [`Error`]: configuration and secret-loading failures

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
