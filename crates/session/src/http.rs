//! Refresh-token grant against the auth server's token endpoint
//!
//! `POST {base_url}/api/v1/auth/token` with HTTP basic client auth
//! (`project_id:publishable_client_key`) and a form body
//! `grant_type=refresh_token&refresh_token=...`.
//!
//! Response classification:
//! - 2xx: new access token
//! - 401/403, or 400 with `invalid_grant`: refresh token is dead, `Ok(None)`
//! - anything else, or a transport failure: `Err`, worth retrying

use common::Secret;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::refresher::{RefreshFuture, TokenRefresher};
use crate::tokens::{AccessToken, RefreshToken};

pub const TOKEN_PATH: &str = "/api/v1/auth/token";

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the access token expires, if the server says.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// How the token endpoint answered a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshClassification {
    Success,
    /// The refresh token is revoked, expired or unknown.
    Rejected,
    /// Server or protocol trouble; the refresh token may still be good.
    Transient,
}

pub fn classify_response(status: StatusCode, body: &str) -> RefreshClassification {
    if status.is_success() {
        return RefreshClassification::Success;
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RefreshClassification::Rejected,
        StatusCode::BAD_REQUEST if body.contains("invalid_grant") => {
            RefreshClassification::Rejected
        }
        _ => RefreshClassification::Transient,
    }
}

pub struct HttpRefresher {
    client: reqwest::Client,
    token_url: String,
    project_id: String,
    client_key: Secret<String>,
}

impl HttpRefresher {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        project_id: impl Into<String>,
        client_key: Secret<String>,
    ) -> Self {
        Self {
            client,
            token_url: format!("{}{TOKEN_PATH}", base_url.trim_end_matches('/')),
            project_id: project_id.into(),
            client_key,
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    fn request(&self, refresh_token: &RefreshToken) -> reqwest::RequestBuilder {
        self.client
            .post(&self.token_url)
            .basic_auth(&self.project_id, Some(self.client_key.expose()))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
    }
}

async fn exchange(request: reqwest::RequestBuilder) -> Result<Option<AccessToken>> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Http(format!("invalid refresh response: {e}")))?;
        debug!(expires_in = ?token.expires_in, "access token refreshed");
        return AccessToken::new(token.access_token).map(Some);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    match classify_response(status, &body) {
        RefreshClassification::Rejected => {
            warn!(status = status.as_u16(), "refresh token rejected by token endpoint");
            Ok(None)
        }
        _ => Err(Error::TokenEndpoint {
            status: status.as_u16(),
            body,
        }),
    }
}

impl TokenRefresher for HttpRefresher {
    fn refresh(&self, refresh_token: &RefreshToken) -> RefreshFuture {
        Box::pin(exchange(self.request(refresh_token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Form;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// Start a mock token endpoint answering every refresh with `status`/`body`.
    async fn mock_token_endpoint(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            TOKEN_PATH,
            post(move || async move {
                (
                    AxumStatus::from_u16(status).unwrap(),
                    [("content-type", "application/json")],
                    body,
                )
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn refresher(base_url: &str) -> HttpRefresher {
        HttpRefresher::new(
            reqwest::Client::new(),
            base_url,
            "proj_1",
            Secret::new("pck_1".to_string()),
        )
    }

    #[test]
    fn classification_table() {
        assert_eq!(
            classify_response(StatusCode::OK, ""),
            RefreshClassification::Success
        );
        assert_eq!(
            classify_response(StatusCode::UNAUTHORIZED, ""),
            RefreshClassification::Rejected
        );
        assert_eq!(
            classify_response(StatusCode::FORBIDDEN, ""),
            RefreshClassification::Rejected
        );
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#),
            RefreshClassification::Rejected
        );
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, r#"{"error":"invalid_request"}"#),
            RefreshClassification::Transient
        );
        assert_eq!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, ""),
            RefreshClassification::Transient
        );
    }

    #[test]
    fn token_url_joins_base_and_path() {
        assert_eq!(
            refresher("https://auth.example.com/").token_url(),
            "https://auth.example.com/api/v1/auth/token"
        );
    }

    #[test]
    fn token_response_deserializes_without_optional_fields() {
        let token: TokenResponse = serde_json::from_str(r#"{"access_token":"at_abc"}"#).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.expires_in, None);
    }

    #[tokio::test]
    async fn sends_refresh_grant_with_basic_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            TOKEN_PATH,
            post(
                |headers: HeaderMap, Form(form): Form<HashMap<String, String>>| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    // base64("proj_1:pck_1")
                    let ok = auth == "Basic cHJval8xOnBja18x"
                        && form.get("grant_type").map(String::as_str) == Some("refresh_token")
                        && form.get("refresh_token").map(String::as_str) == Some("rt_live");
                    if ok {
                        (AxumStatus::OK, r#"{"access_token":"at_new"}"#)
                    } else {
                        (AxumStatus::BAD_REQUEST, r#"{"error":"invalid_request"}"#)
                    }
                },
            ),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let token = refresher(&format!("http://{addr}"))
            .refresh(&RefreshToken::new("rt_live").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.as_str(), "at_new");
    }

    #[tokio::test]
    async fn rejected_refresh_token_yields_none() {
        let base = mock_token_endpoint(401, r#"{"error":"unauthorized"}"#).await;
        let outcome = refresher(&base)
            .refresh(&RefreshToken::new("rt_dead").unwrap())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn invalid_grant_yields_none() {
        let base = mock_token_endpoint(400, r#"{"error":"invalid_grant"}"#).await;
        let outcome = refresher(&base)
            .refresh(&RefreshToken::new("rt_dead").unwrap())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_errors() {
        let base = mock_token_endpoint(503, r#"{"error":"down"}"#).await;
        let err = refresher(&base)
            .refresh(&RefreshToken::new("rt_live").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenEndpoint { status: 503, .. }));
    }

    #[tokio::test]
    async fn connection_failures_are_errors() {
        // Bind then drop to get a port with nothing listening.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let err = refresher(&format!("http://{addr}"))
            .refresh(&RefreshToken::new("rt_live").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }
}
