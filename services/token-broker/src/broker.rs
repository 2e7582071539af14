//! Token broker over a single session
//!
//! Lookups go through `Session::get_or_fetch_likely_valid_tokens` with
//! retries on transient failures. Forced refreshes go through an
//! `AsyncValueCache`, whose batching rate limiter turns a burst of refresh
//! requests into one call to the token endpoint. The cache's first fetch
//! warms the session at startup.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_cache::{AsyncValueCache, CacheOptions};
use async_state::{ErrorSinks, RetryOptions, Subscription, retry};
use session::{AccessToken, Session, SessionState};
use tracing::{debug, error};

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::metrics;

/// Served tokens stay valid for at least this long.
pub const MIN_TOKEN_VALIDITY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub options: RetryOptions,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            options: config.options(),
        }
    }
}

/// Failures the token endpoint may recover from. Invalid tokens and expiry
/// mismatches come out the same on every attempt.
fn is_transient(err: &session::Error) -> bool {
    matches!(
        err,
        session::Error::Http(_) | session::Error::TokenEndpoint { .. } | session::Error::Refresh(_)
    )
}

/// Run `f` under `policy`, retrying transient session errors only.
async fn retry_transient<T, F, Fut>(policy: RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = session::Result<T>>,
{
    let outcome = retry(
        || {
            let attempt = f();
            async move {
                match attempt.await {
                    Err(e) if !is_transient(&e) => Ok(Err(e)),
                    other => other.map(Ok),
                }
            }
        },
        policy.max_attempts,
        policy.options,
    )
    .await;

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Refresh(format!("token refresh failed: {e}"))),
        Err(e) => Err(Error::Refresh(format!("token refresh failed: {e}"))),
    }
}

#[derive(Clone)]
pub struct Broker {
    session: Session,
    forced_refresh: AsyncValueCache<Option<AccessToken>>,
    retry: RetryPolicy,
    /// Session observers, registered for the broker's lifetime.
    _on_invalidate: Arc<Subscription>,
    _on_token_change: Arc<Subscription>,
}

impl Broker {
    /// Must be called inside a tokio runtime.
    pub fn new(session: Session, retry: RetryPolicy, cache: CacheOptions, sinks: ErrorSinks) -> Self {
        metrics::set_session_valid(!session.is_known_to_be_invalid());
        let on_invalidate = session.on_invalidate(|| {
            error!("session invalidated, new credentials are required");
            metrics::set_session_valid(false);
        });
        let on_token_change = session.on_access_token_change(|token| {
            debug!(
                has_token = token.is_some(),
                expires_at = ?token.and_then(AccessToken::expires_at),
                "access token changed"
            );
        });

        let forced_refresh = {
            let session = session.clone();
            AsyncValueCache::new(
                move |first| {
                    let session = session.clone();
                    async move {
                        let tokens = if first {
                            retry_transient(retry, || session.get_potentially_expired_tokens())
                                .await
                        } else {
                            retry_transient(retry, || session.fetch_new_tokens()).await
                        };
                        tokens
                            .map(|tokens| tokens.map(|t| t.access_token))
                            .map_err(async_state::Error::fetch)
                    }
                },
                cache,
                sinks,
            )
        };

        Self {
            session,
            forced_refresh,
            retry,
            _on_invalidate: Arc::new(on_invalidate),
            _on_token_change: Arc::new(on_token_change),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// An access token valid for at least [`MIN_TOKEN_VALIDITY`].
    pub async fn token(&self) -> Result<AccessToken> {
        let tokens = retry_transient(self.retry, || {
            self.session
                .get_or_fetch_likely_valid_tokens(MIN_TOKEN_VALIDITY)
        })
        .await?;
        tokens
            .map(|tokens| tokens.access_token)
            .ok_or(Error::SessionInvalid)
    }

    /// A freshly issued access token. Concurrent calls share one refresh.
    pub async fn force_refresh(&self) -> Result<AccessToken> {
        let token = self.forced_refresh.refresh().await.map_err(|e| match e {
            async_state::Error::Fetch(source) => Error::Refresh(source.to_string()),
            other => Error::Refresh(format!("token refresh failed: {other}")),
        })?;
        token.ok_or(Error::SessionInvalid)
    }
}
