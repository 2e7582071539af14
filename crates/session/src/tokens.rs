//! Access and refresh tokens
//!
//! Both are opaque strings wrapped in `common::Secret`. An `AccessToken` also
//! carries the expiry decoded from its JWT `exp` claim; tokens that are not
//! JWTs, or carry no `exp`, never expire. Access token identity is reference
//! identity: clones of one token are the same token, two tokens built from
//! the same string are not.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use serde::Deserialize;

use crate::error::{Error, Result};

fn check_token(kind: &'static str, token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::InvalidToken {
            kind,
            reason: "empty".into(),
        });
    }
    if token == "undefined" {
        return Err(Error::InvalidToken {
            kind,
            reason: "the literal string 'undefined' is not a real token".into(),
        });
    }
    Ok(())
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Expiry from the JWT `exp` claim. The signature is not verified.
fn decode_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let exp = serde_json::from_slice::<Claims>(&bytes).ok()?.exp?;
    UNIX_EPOCH.checked_add(Duration::try_from_secs_f64(exp).ok()?)
}

struct AccessTokenInner {
    token: Secret<String>,
    expires_at: Option<SystemTime>,
}

#[derive(Clone)]
pub struct AccessToken {
    inner: Arc<AccessTokenInner>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        check_token("access", &token)?;
        let expires_at = decode_expiry(&token);
        Ok(Self {
            inner: Arc::new(AccessTokenInner {
                token: Secret::new(token),
                expires_at,
            }),
        })
    }

    pub fn as_str(&self) -> &str {
        self.inner.token.expose()
    }

    /// `None` when the token carries no expiry.
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.inner.expires_at
    }

    /// Time left before expiry, zero once expired. `Duration::MAX` when the
    /// token carries no expiry.
    pub fn expires_in(&self) -> Duration {
        match self.inner.expires_at {
            Some(at) => at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_in().is_zero()
    }

    /// Whether `a` and `b` are the same token instance.
    pub fn ptr_eq(a: &AccessToken, b: &AccessToken) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &self.inner.token)
            .field("expires_at", &self.inner.expires_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct RefreshToken {
    token: Arc<Secret<String>>,
}

impl RefreshToken {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        check_token("refresh", &token)?;
        Ok(Self {
            token: Arc::new(Secret::new(token)),
        })
    }

    pub fn as_str(&self) -> &str {
        self.token.expose()
    }
}

impl From<Secret<String>> for RefreshToken {
    fn from(secret: Secret<String>) -> Self {
        Self {
            token: Arc::new(secret),
        }
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefreshToken").field(&self.token).finish()
    }
}

/// An access token plus the refresh token it was issued under, if any.
#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
}


#[cfg(test)]
mod tests {
    use super::test_support::jwt_expiring_in;
    use super::*;

    #[test]
    fn rejects_undefined_and_empty() {
        assert!(matches!(
            AccessToken::new("undefined"),
            Err(Error::InvalidToken { kind: "access", .. })
        ));
        assert!(matches!(
            RefreshToken::new(""),
            Err(Error::InvalidToken { kind: "refresh", .. })
        ));
    }

    #[test]
    fn decodes_jwt_expiry() {
        let token = AccessToken::new(jwt_expiring_in(120)).unwrap();
        let left = token.expires_in();
        assert!(left > Duration::from_secs(100) && left <= Duration::from_secs(120));
        assert!(!token.is_expired());
    }

    #[test]
    fn past_expiry_is_expired() {
        let token = AccessToken::new(jwt_expiring_in(-5)).unwrap();
        assert!(token.is_expired());
        assert_eq!(token.expires_in(), Duration::ZERO);
    }

    #[test]
    fn out_of_range_expiry_is_ignored() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        for exp in ["1e20", "1e300", "-1"] {
            let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
            let token = AccessToken::new(format!("{header}.{payload}.")).unwrap();
            assert_eq!(token.expires_at(), None, "exp = {exp}");
            assert!(!token.is_expired());
        }
    }

    #[test]
    fn opaque_tokens_never_expire() {
        let token = AccessToken::new("at_opaque").unwrap();
        assert_eq!(token.expires_at(), None);
        assert!(!token.is_expired());
        assert_eq!(token.expires_in(), Duration::MAX);
    }

    #[test]
    fn identity_is_by_instance() {
        let a = AccessToken::new("at1").unwrap();
        let clone = a.clone();
        let twin = AccessToken::new("at1").unwrap();

        assert!(AccessToken::ptr_eq(&a, &clone));
        assert!(!AccessToken::ptr_eq(&a, &twin));
    }

    #[test]
    fn debug_output_is_redacted() {
        let access = AccessToken::new("at_secret").unwrap();
        let refresh = RefreshToken::new("rt_secret").unwrap();
        let rendered = format!("{access:?} {refresh:?}");
        assert!(!rendered.contains("secret"), "got: {rendered}");
        assert!(rendered.contains("[REDACTED]"));
    }
}
