use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::provider::ProviderId;

/// An OAuth session for one provider. Only the token store creates or mutates these.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub provider_id: ProviderId,
    pub access_token: String,
    /// Absent for grants that re-assert instead of refreshing (service accounts).
    pub refresh_token: Option<String>,
    pub expiry_timestamp: DateTime<Utc>,
}

impl Credential {
    /// True when the credential stays valid for at least `skew` past `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expiry_timestamp - skew > now
    }
}

// Tokens must never reach the logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("provider_id", &self.provider_id)
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expiry_timestamp", &self.expiry_timestamp)
            .finish()
    }
}
