//! Provider adapters: a uniform paged listing and byte download over each
//! provider's API. Adapters are stateless; the sync position lives in
//! `CursorState` and the page token in [`listing::Listing`].
//!
//! Every HTTP request an adapter makes runs under its [`RetryPolicy`]: each
//! request gets its own timeout and retries, however many requests one
//! listing page takes.

pub mod google;
pub mod listing;
pub mod microsoft;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::errors::PipelineError;
use crate::models::artifact::ArtifactRef;
use crate::models::credential::Credential;
use crate::models::provider::ProviderId;
use crate::retry::{RetryPolicy, Retryable};

pub use google::{DriveAdapter, DriveLinks};
pub use listing::Listing;
pub use microsoft::GraphGroupAdapter;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport failure, timeout, throttling or 5xx. Retryable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// 401, or 403 without a quota or per-file reason: the access token was
    /// not accepted.
    #[error("provider rejected credentials: {0}")]
    Auth(String),

    /// The provider no longer honours the page token being followed.
    #[error("page token expired")]
    PageTokenExpired,

    /// Malformed response, or a refusal scoped to one item (missing file,
    /// export too large). Not retried.
    #[error("malformed provider response: {0}")]
    Protocol(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        ProviderError::Unavailable(format!("no response within {after:?}"))
    }
}

impl ProviderError {
    pub fn into_pipeline(self, provider: ProviderId) -> PipelineError {
        let message = self.to_string();
        match self {
            ProviderError::Unavailable(_) => PipelineError::ProviderUnavailable { provider, message },
            ProviderError::Auth(_) => PipelineError::ProviderAuth { provider, message },
            ProviderError::PageTokenExpired | ProviderError::Protocol(_) => {
                PipelineError::ProviderProtocol { provider, message }
            }
        }
    }
}

/// One page of a provider listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub items: Vec<ArtifactRef>,
    /// Opaque continuation; `None` on the last page.
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Lists artifacts modified at or after `since` (everything when `None`).
    /// `page_token` continues a previous call.
    async fn list_page(
        &self,
        credential: &Credential,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<ListPage, ProviderError>;

    async fn fetch_bytes(
        &self,
        credential: &Credential,
        artifact: &ArtifactRef,
    ) -> Result<Bytes, ProviderError>;
}

/// Google Drive files linked from another provider's messages, downloaded
/// with the Google credential.
#[async_trait]
pub trait LinkedFiles: Send + Sync {
    async fn fetch_linked(
        &self,
        file_id: &str,
        mime_type: Option<&str>,
    ) -> Result<Bytes, ProviderError>;
}

/// 403 reasons that mean "slow down" rather than "bad token".
const THROTTLE_REASONS: &[&str] = &[
    "ratelimitexceeded",
    "userratelimitexceeded",
    "dailylimitexceeded",
    "quotaexceeded",
];

/// 403 reasons scoped to the requested item. A new token would not help.
const ITEM_REASONS: &[&str] = &[
    "exportsizelimitexceeded",
    "cannotexportfile",
    "cannotdownloadabusivefile",
    "filenotdownloadable",
    "downloadquotaexceeded",
    "appnotauthorizedtofile",
    "insufficientfilepermissions",
];

/// Classifies a non-success HTTP status. `paging` marks requests that followed
/// a page token, where 400/410 means the token went stale.
pub(crate) fn classify_status(status: StatusCode, body: &str, paging: bool) -> ProviderError {
    let detail = format!("status {status}: {}", truncate(body, 200));
    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Auth(detail),
        StatusCode::FORBIDDEN => {
            let reasons = error_reasons(body);
            let any_of = |known: &[&str]| reasons.iter().any(|r| known.contains(&r.as_str()));
            if any_of(THROTTLE_REASONS) {
                ProviderError::Unavailable(detail)
            } else if any_of(ITEM_REASONS) {
                ProviderError::Protocol(detail)
            } else {
                ProviderError::Auth(detail)
            }
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            ProviderError::Unavailable(detail)
        }
        StatusCode::GONE | StatusCode::BAD_REQUEST if paging => ProviderError::PageTokenExpired,
        s if s.is_server_error() => ProviderError::Unavailable(detail),
        _ => ProviderError::Protocol(detail),
    }
}

/// Machine-readable reasons of a Google-style error body, lower-cased with
/// underscores dropped (`RATE_LIMIT_EXCEEDED` and `rateLimitExceeded` match).
fn error_reasons(body: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return Vec::new();
    };
    let error = &value["error"];
    ["errors", "details"]
        .iter()
        .filter_map(|key| error[*key].as_array())
        .flatten()
        .filter_map(|entry| entry["reason"].as_str())
        .map(|reason| reason.replace('_', "").to_ascii_lowercase())
        .collect()
}

/// Sends one request and turns a non-success status into an error.
async fn send(request: RequestBuilder, paging: bool) -> Result<Response, ProviderError> {
    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body, paging))
}

/// GETs and decodes JSON under `retry`. `request` builds a fresh request per
/// attempt; the timeout covers reading the body.
pub(crate) async fn get_json<T, F>(
    retry: &RetryPolicy,
    what: &str,
    paging: bool,
    request: F,
) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
    F: Fn() -> RequestBuilder,
{
    let request = &request;
    retry
        .run(what, move || async move {
            send(request(), paging).await?.json::<T>().await.map_err(transport)
        })
        .await
}

/// Downloads a body under `retry`.
pub(crate) async fn get_bytes<F>(
    retry: &RetryPolicy,
    what: &str,
    request: F,
) -> Result<Bytes, ProviderError>
where
    F: Fn() -> RequestBuilder,
{
    let request = &request;
    retry
        .run(what, move || async move {
            send(request(), false).await?.bytes().await.map_err(transport)
        })
        .await
}

pub(crate) fn transport(err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Protocol(err.to_string())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

/// RFC 3339 with a `Z` suffix, as both provider query languages expect.
pub(crate) fn query_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
