//! Refresh callback abstraction
//!
//! The session delegates the network side of a refresh to a `TokenRefresher`.
//! `Ok(None)` means the refresh token was rejected and the session is over;
//! `Err` is a failure worth retrying later.

use std::future::Future;
use std::pin::Pin;

use futures_util::FutureExt;

use crate::error::Result;
use crate::tokens::{AccessToken, RefreshToken};

/// Future returned by [`TokenRefresher::refresh`].
pub type RefreshFuture = Pin<Box<dyn Future<Output = Result<Option<AccessToken>>> + Send>>;

/// Exchanges a refresh token for a new access token.
///
/// Uses a boxed future so sessions can hold an `Arc<dyn TokenRefresher>`.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: &RefreshToken) -> RefreshFuture;
}

impl<F, Fut> TokenRefresher for F
where
    F: Fn(RefreshToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<AccessToken>>> + Send + 'static,
{
    fn refresh(&self, refresh_token: &RefreshToken) -> RefreshFuture {
        self(refresh_token.clone()).boxed()
    }
}
