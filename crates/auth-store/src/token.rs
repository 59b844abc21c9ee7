//! Login and token refresh endpoint calls
//!
//! Handles the two token-producing HTTP interactions:
//! 1. Login: POST caller-supplied credentials to the login URL
//! 2. Refresh: POST `{"refresh_token": ...}` to the refresh URL
//!
//! Both responses carry `access_token` and an optional `refresh_token`. A
//! response without `access_token` is a failed exchange even on 2xx.

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Tokens returned by a login or refresh.
///
/// `refresh_token` is `None` when the server did not rotate it; the caller
/// keeps the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<&str>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: refresh_token.map(Secret::from),
        }
    }
}

/// Wire shape shared by login and refresh responses.
#[derive(Deserialize)]
struct GrantBody {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl GrantBody {
    fn into_grant(self) -> Result<TokenGrant> {
        let access = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::TokenExchange("response does not contain access_token".into()))?;
        Ok(TokenGrant {
            access_token: Secret::new(access),
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
        })
    }
}

/// Result of a successful login: the tokens plus the full response body,
/// which may carry application fields (user profile, permissions, ...).
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub grant: TokenGrant,
    pub body: serde_json::Value,
}

/// Exchange login credentials for tokens.
///
/// `credentials` is forwarded verbatim as the JSON request body.
pub async fn login(
    client: &reqwest::Client,
    login_url: &str,
    credentials: &serde_json::Value,
) -> Result<LoginResponse> {
    let response = client
        .post(login_url)
        .json(credentials)
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading login response: {e}")))?;

    if !status.is_success() {
        let message = error_message(&text).unwrap_or_else(|| format!("login returned {status}"));
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(message));
        }
        return Err(Error::TokenExchange(message));
    }

    let body: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| Error::TokenExchange(format!("invalid login response: {e}")))?;
    let grant = serde_json::from_value::<GrantBody>(body.clone())
        .map_err(|e| Error::TokenExchange(format!("invalid login response: {e}")))?
        .into_grant()?;

    debug!(has_refresh = grant.refresh_token.is_some(), "login succeeded");
    Ok(LoginResponse { grant, body })
}

/// Exchange a refresh token for a new access token.
///
/// 401/403 from the refresh endpoint means the refresh token is revoked or
/// invalid and is reported as `InvalidCredentials`.
pub async fn refresh_token(
    client: &reqwest::Client,
    refresh_url: &str,
    refresh: &Secret<String>,
) -> Result<TokenGrant> {
    let response = client
        .post(refresh_url)
        .json(&serde_json::json!({ "refresh_token": refresh.expose() }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<GrantBody>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?
        .into_grant()
}

/// Pull a human-readable message out of an error body (`{"message": ...}`).
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_owned)
}
