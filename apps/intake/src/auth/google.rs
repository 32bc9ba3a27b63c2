use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::Serialize;

use crate::auth::exchange::{post_token_form, ExchangeError, TokenExchanger, TokenGrant};
use crate::models::credential::Credential;
use crate::models::provider::ProviderId;

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Serialize, PartialEq)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Google service-account session: every refresh signs a fresh JWT assertion
/// with the account's private key, so no refresh token is ever stored.
pub struct GoogleServiceAccountGrant {
    client: Client,
    client_email: String,
    private_key_pem: String,
    scope: String,
}

impl GoogleServiceAccountGrant {
    pub fn new(client: Client, client_email: String, private_key_pem: String) -> Self {
        Self {
            client,
            client_email,
            private_key_pem,
            scope: DRIVE_READONLY_SCOPE.to_string(),
        }
    }

    fn claims(&self, issued_at: i64) -> AssertionClaims<'_> {
        AssertionClaims {
            iss: &self.client_email,
            scope: &self.scope,
            aud: TOKEN_URL,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        }
    }

    fn assertion(&self, issued_at: i64) -> Result<String, ExchangeError> {
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .map_err(|e| ExchangeError::Misconfigured(format!("service account key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &self.claims(issued_at), &key)
            .map_err(|e| ExchangeError::Misconfigured(format!("signing assertion: {e}")))
    }
}

#[async_trait]
impl TokenExchanger for GoogleServiceAccountGrant {
    fn provider(&self) -> ProviderId {
        ProviderId::Google
    }

    fn can_bootstrap(&self) -> bool {
        true
    }

    async fn exchange(&self, _current: Option<&Credential>) -> Result<TokenGrant, ExchangeError> {
        let assertion = self.assertion(Utc::now().timestamp())?;
        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let mut grant = post_token_form(&self.client, TOKEN_URL, &form).await?;
        grant.refresh_token = None;
        Ok(grant)
    }
}
