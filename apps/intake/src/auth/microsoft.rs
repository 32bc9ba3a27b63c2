use async_trait::async_trait;
use reqwest::Client;

use crate::auth::exchange::{post_token_form, ExchangeError, TokenExchanger, TokenGrant};
use crate::models::credential::Credential;
use crate::models::provider::ProviderId;

pub const DEFAULT_SCOPES: &str = "Group.Read.All User.Read offline_access";

/// Delegated Microsoft identity platform session, kept alive with the
/// `refresh_token` grant. The first credential comes from interactive consent
/// outside this service.
pub struct MicrosoftRefreshGrant {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    scopes: String,
}

impl MicrosoftRefreshGrant {
    pub fn new(client: Client, tenant_id: &str, client_id: String) -> Self {
        Self {
            client,
            token_url: format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token"),
            client_id,
            client_secret: None,
            scopes: DEFAULT_SCOPES.to_string(),
        }
    }

    /// Confidential clients authenticate the refresh with a secret.
    pub fn with_client_secret(mut self, client_secret: String) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    fn form<'a>(&'a self, refresh_token: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", self.scopes.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        form
    }
}

#[async_trait]
impl TokenExchanger for MicrosoftRefreshGrant {
    fn provider(&self) -> ProviderId {
        ProviderId::Microsoft
    }

    fn can_bootstrap(&self) -> bool {
        false
    }

    async fn exchange(&self, current: Option<&Credential>) -> Result<TokenGrant, ExchangeError> {
        let refresh_token = current
            .and_then(|c| c.refresh_token.as_deref())
            .ok_or_else(|| ExchangeError::Rejected {
                error: "missing_refresh_token".to_string(),
                description: Some("interactive consent required".to_string()),
            })?;

        post_token_form(&self.client, &self.token_url, &self.form(refresh_token)).await
    }
}
