use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

use crate::models::credential::Credential;
use crate::models::provider::ProviderId;
use crate::retry::Retryable;

/// Result of a successful token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// `None` when the provider did not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The authorization server refused the grant (`invalid_grant`,
    /// `invalid_client`, revoked consent...). Needs a human.
    #[error("grant rejected: {error}{}", detail(.description))]
    Rejected {
        error: String,
        description: Option<String>,
    },

    /// The exchange cannot even be attempted, e.g. a malformed signing key.
    #[error("exchange misconfigured: {0}")]
    Misconfigured(String),

    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected token response: {0}")]
    Protocol(String),
}

fn detail(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

impl Retryable for ExchangeError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        ExchangeError::Unavailable(format!("no response within {after:?}"))
    }
}

/// One provider's way of turning the stored credential into a fresh one.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Whether a credential can be obtained with nothing stored.
    fn can_bootstrap(&self) -> bool;

    async fn exchange(&self, current: Option<&Credential>) -> Result<TokenGrant, ExchangeError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Azure has historically sent `expires_in` as a string; Google sends a number.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Parses a token endpoint reply into a grant or a classified error.
pub(crate) fn parse_token_response(
    status: StatusCode,
    body: &str,
) -> Result<TokenGrant, ExchangeError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(ExchangeError::Unavailable(format!("status {status}")));
    }

    if !status.is_success() {
        return match serde_json::from_str::<TokenErrorResponse>(body) {
            Ok(e) => Err(ExchangeError::Rejected {
                error: e.error,
                description: e.error_description,
            }),
            Err(_) => Err(ExchangeError::Protocol(format!(
                "status {status} without an OAuth error body"
            ))),
        };
    }

    let token: TokenResponse =
        serde_json::from_str(body).map_err(|e| ExchangeError::Protocol(e.to_string()))?;
    if token.access_token.is_empty() {
        return Err(ExchangeError::Protocol("empty access_token".to_string()));
    }

    Ok(TokenGrant {
        access_token: token.access_token,
        refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        expires_in_secs: token.expires_in,
    })
}

/// POSTs a form to a token endpoint.
pub(crate) async fn post_token_form(
    client: &Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<TokenGrant, ExchangeError> {
    let response = client
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| ExchangeError::Unavailable(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ExchangeError::Unavailable(e.to_string()))?;
    debug!("Token endpoint {url} answered {status}");

    parse_token_response(status, &body)
}
