//! Token lifecycle for one authenticated session
//!
//! States: valid with a cached access token, valid but needing a refresh,
//! refreshing, and invalid. Invalid is terminal.
//!
//! At most one refresh is shared at a time. Callers that find no usable
//! access token join the in-flight refresh instead of starting their own;
//! `fetch_new_tokens` always starts a new one, which supersedes the old.
//! A refresh only writes its outcome into the session if it is still the
//! current refresh when it completes, so a superseded refresh can never
//! overwrite a newer token.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_state::{Store, Subscription};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::refresher::TokenRefresher;
use crate::tokens::{AccessToken, RefreshToken, Tokens};

/// Longest expiry margin callers may ask for. Access tokens are short-lived.
pub const MAX_MIN_UNTIL_EXPIRATION: Duration = Duration::from_secs(60);

const NOT_LOGGED_IN: &str = "not-logged-in";

type SharedRefresh = Shared<BoxFuture<'static, Result<Option<AccessToken>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ValidWithCachedAccessToken,
    ValidNeedsRefresh,
    Refreshing,
    Invalid,
}

impl SessionState {
    /// Label for health reporting and logs.
    pub fn label(self) -> &'static str {
        match self {
            SessionState::ValidWithCachedAccessToken => "valid",
            SessionState::ValidNeedsRefresh => "needs_refresh",
            SessionState::Refreshing => "refreshing",
            SessionState::Invalid => "invalid",
        }
    }
}

struct RefreshSlot {
    generation: u64,
    pending: Option<SharedRefresh>,
}

struct SessionInner {
    session_key: String,
    access_token: Store<Option<AccessToken>>,
    refresh_token: Option<RefreshToken>,
    known_to_be_invalid: Store<bool>,
    refresher: Arc<dyn TokenRefresher>,
    refresh: Mutex<RefreshSlot>,
}

/// One session's tokens. Clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// A session with neither token starts out invalid.
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        refresh_token: Option<RefreshToken>,
        access_token: Option<AccessToken>,
    ) -> Self {
        let session_key = Self::calculate_session_key(
            refresh_token.as_ref().map(RefreshToken::as_str),
            access_token.as_ref().map(AccessToken::as_str),
        );
        let invalid = refresh_token.is_none() && access_token.is_none();
        Self {
            inner: Arc::new(SessionInner {
                session_key,
                access_token: Store::new(access_token),
                refresh_token,
                known_to_be_invalid: Store::new(invalid),
                refresher,
                refresh: Mutex::new(RefreshSlot {
                    generation: 0,
                    pending: None,
                }),
            }),
        }
    }

    /// Key identifying the logical session: derived from the refresh token
    /// if present, else the access token. Sessions with equal keys are the
    /// same session.
    pub fn calculate_session_key(refresh_token: Option<&str>, access_token: Option<&str>) -> String {
        match (refresh_token, access_token) {
            (Some(refresh), _) => format!("refresh-{refresh}"),
            (None, Some(access)) => format!("access-{access}"),
            (None, None) => NOT_LOGGED_IN.to_string(),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.inner.session_key
    }

    pub fn refresh_token(&self) -> Option<&RefreshToken> {
        self.inner.refresh_token.as_ref()
    }

    pub fn is_known_to_be_invalid(&self) -> bool {
        self.inner.known_to_be_invalid.get()
    }

    pub fn state(&self) -> SessionState {
        if self.is_known_to_be_invalid() {
            return SessionState::Invalid;
        }
        let refreshing = self
            .inner
            .refresh
            .lock()
            .pending
            .as_ref()
            .is_some_and(|refresh| refresh.peek().is_none());
        if refreshing {
            SessionState::Refreshing
        } else if self.cached_access_token().is_some() {
            SessionState::ValidWithCachedAccessToken
        } else {
            SessionState::ValidNeedsRefresh
        }
    }

    /// Cached access token unless it has already expired.
    fn cached_access_token(&self) -> Option<AccessToken> {
        self.inner
            .access_token
            .get()
            .filter(|token| !token.is_expired())
    }

    fn tokens(&self, access_token: AccessToken) -> Tokens {
        Tokens {
            access_token,
            refresh_token: self.inner.refresh_token.clone(),
        }
    }

    /// The cached tokens, or tokens from a shared refresh when nothing is
    /// cached. `None` when the session is invalid or has nothing to refresh
    /// with. The access token may expire soon after this returns.
    pub async fn get_potentially_expired_tokens(&self) -> Result<Option<Tokens>> {
        if self.is_known_to_be_invalid() {
            return Ok(None);
        }
        if let Some(access_token) = self.cached_access_token() {
            return Ok(Some(self.tokens(access_token)));
        }
        let Some(refresh_token) = self.inner.refresh_token.clone() else {
            return Ok(None);
        };
        let refresh = self.join_or_start_refresh(refresh_token);
        Ok(refresh.await?.map(|access_token| self.tokens(access_token)))
    }

    /// Tokens from a refresh started now, never from the cache.
    pub async fn fetch_new_tokens(&self) -> Result<Option<Tokens>> {
        if self.is_known_to_be_invalid() {
            return Ok(None);
        }
        let Some(refresh_token) = self.inner.refresh_token.clone() else {
            return Ok(None);
        };
        let refresh = self.start_refresh(&mut self.inner.refresh.lock(), refresh_token);
        Ok(refresh.await?.map(|access_token| self.tokens(access_token)))
    }

    /// Cached tokens if the access token stays valid for at least
    /// `min_until_expiration`, otherwise freshly fetched ones.
    pub async fn get_or_fetch_likely_valid_tokens(
        &self,
        min_until_expiration: Duration,
    ) -> Result<Option<Tokens>> {
        if min_until_expiration >= MAX_MIN_UNTIL_EXPIRATION {
            return Err(Error::ExpiryTooLong(min_until_expiration));
        }

        if let Some(access_token) = self.cached_access_token()
            && access_token.expires_in() >= min_until_expiration
        {
            return Ok(Some(self.tokens(access_token)));
        }

        let tokens = self.fetch_new_tokens().await?;
        if let Some(tokens) = &tokens {
            let actual = tokens.access_token.expires_in();
            if actual < min_until_expiration {
                return Err(Error::TokenTooShortLived {
                    required: min_until_expiration,
                    actual,
                });
            }
        }
        Ok(tokens)
    }

    /// Forget `access_token` if it is still the cached one. A token that a
    /// concurrent refresh already replaced is left alone.
    pub fn mark_access_token_expired(&self, access_token: &AccessToken) {
        let cleared = self.inner.access_token.replace_if(
            |current| {
                current
                    .as_ref()
                    .is_some_and(|current| AccessToken::ptr_eq(current, access_token))
            },
            None,
        );
        if cleared {
            debug!(session_key = %self.redacted_key(), "access token marked expired");
        }
    }

    /// Invalidate the session for good. Any in-flight refresh is superseded.
    pub fn mark_invalid(&self) {
        {
            let mut slot = self.inner.refresh.lock();
            slot.generation += 1;
            slot.pending = None;
        }
        self.inner.access_token.replace_if(Option::is_some, None);
        if self.inner.known_to_be_invalid.replace_if(|invalid| !invalid, true) {
            info!(session_key = %self.redacted_key(), "session invalidated");
        }
    }

    /// Fires once, when the session becomes invalid.
    pub fn on_invalidate(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner
            .known_to_be_invalid
            .on_change(move |invalid, _| {
                if *invalid {
                    callback();
                }
            })
    }

    /// Fires whenever the cached access token changes. `None` does not
    /// imply invalidation; the token may just have expired.
    pub fn on_access_token_change(
        &self,
        callback: impl Fn(Option<&AccessToken>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .access_token
            .on_change(move |token, _| callback(token.as_ref()))
    }

    fn join_or_start_refresh(&self, refresh_token: RefreshToken) -> SharedRefresh {
        let mut slot = self.inner.refresh.lock();
        if let Some(pending) = &slot.pending
            && pending.peek().is_none()
        {
            return pending.clone();
        }
        self.start_refresh(&mut slot, refresh_token)
    }

    /// Install a new shared refresh as the current one. The refresher is
    /// first invoked when the returned future is polled, outside the lock.
    fn start_refresh(&self, slot: &mut RefreshSlot, refresh_token: RefreshToken) -> SharedRefresh {
        slot.generation += 1;
        let generation = slot.generation;
        let refresher = self.inner.refresher.clone();
        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);

        let refresh = async move {
            let outcome = refresher.refresh(&refresh_token).await;
            metrics::record_refresh(&outcome);
            if let Some(inner) = session.upgrade() {
                Session { inner }.finish_refresh(generation, &outcome);
            }
            outcome
        }
        .boxed()
        .shared();

        slot.pending = Some(refresh.clone());
        debug!(generation, "started token refresh");
        refresh
    }

    fn finish_refresh(&self, generation: u64, outcome: &Result<Option<AccessToken>>) {
        {
            let mut slot = self.inner.refresh.lock();
            if slot.generation != generation {
                debug!(generation, current = slot.generation, "discarding superseded refresh");
                return;
            }
            slot.pending = None;
        }

        match outcome {
            Ok(Some(access_token)) => {
                self.inner.access_token.set(Some(access_token.clone()));
            }
            Ok(None) => self.mark_invalid(),
            Err(e) => {
                warn!(session_key = %self.redacted_key(), error = %e, "token refresh failed");
            }
        }
    }

    /// Session key safe for logs: the kind prefix only.
    fn redacted_key(&self) -> &str {
        let key = self.session_key();
        key.split_once('-').map_or(key, |(kind, _)| kind)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_key", &self.redacted_key())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
