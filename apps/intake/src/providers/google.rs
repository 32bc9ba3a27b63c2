use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::auth::TokenStore;
use crate::errors::ErrorKind;
use crate::models::artifact::ArtifactRef;
use crate::models::credential::Credential;
use crate::models::provider::ProviderId;
use crate::providers::{
    get_bytes, get_json, query_timestamp, LinkedFiles, ListPage, ProviderAdapter, ProviderError,
};
use crate::retry::RetryPolicy;

pub const DRIVE_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
pub const PAGE_SIZE: &str = "100";
const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, modifiedTime, md5Checksum)";

const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const GOOGLE_APPS_PREFIX: &str = "application/vnd.google-apps.";
pub const GOOGLE_DOC: &str = "application/vnd.google-apps.document";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: Option<String>,
    mime_type: Option<String>,
    modified_time: DateTime<Utc>,
    md5_checksum: Option<String>,
}

impl DriveFile {
    /// Binary uploads download as-is and Google Docs export to DOCX. Other
    /// native Google types (sheets, folders, forms) hold no resume.
    fn is_downloadable(&self) -> bool {
        match self.mime_type.as_deref() {
            Some(GOOGLE_DOC) => true,
            Some(m) => !m.starts_with(GOOGLE_APPS_PREFIX),
            None => true,
        }
    }

    fn into_artifact(self) -> ArtifactRef {
        ArtifactRef {
            provider_id: ProviderId::Google,
            artifact_id: self.id,
            source_timestamp: self.modified_time,
            content_hash: self.md5_checksum,
            name: self.name,
            mime_type: self.mime_type,
            message_text: None,
        }
    }
}

/// Google Drive folder read through a service account.
pub struct DriveAdapter {
    client: Client,
    base_url: String,
    folder_id: String,
    retry: RetryPolicy,
}

impl DriveAdapter {
    pub fn new(client: Client, folder_id: String) -> Self {
        Self {
            client,
            base_url: DRIVE_BASE_URL.to_string(),
            folder_id,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn list_query(&self, since: Option<DateTime<Utc>>) -> String {
        let folder = self.folder_id.replace('\\', "\\\\").replace('\'', "\\'");
        let mut q = format!("'{folder}' in parents and trashed = false");
        if let Some(since) = since {
            q.push_str(&format!(" and modifiedTime >= '{}'", query_timestamp(since)));
        }
        q
    }

    fn list_request(
        &self,
        credential: &Credential,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}/files", self.base_url))
            .bearer_auth(&credential.access_token)
            .query(&[
                ("q", self.list_query(since).as_str()),
                ("orderBy", "modifiedTime"),
                ("pageSize", PAGE_SIZE),
                ("fields", LIST_FIELDS),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        request
    }

    fn download_request(
        &self,
        credential: &Credential,
        file_id: &str,
        mime_type: Option<&str>,
    ) -> RequestBuilder {
        let file_url = format!("{}/files/{file_id}", self.base_url);
        let request = if mime_type == Some(GOOGLE_DOC) {
            self.client
                .get(format!("{file_url}/export"))
                .query(&[("mimeType", DOCX)])
        } else {
            self.client
                .get(file_url)
                .query(&[("alt", "media"), ("supportsAllDrives", "true")])
        };
        request.bearer_auth(&credential.access_token)
    }

    /// Downloads one file, exporting Google Docs to DOCX.
    pub async fn fetch_file(
        &self,
        credential: &Credential,
        file_id: &str,
        mime_type: Option<&str>,
    ) -> Result<Bytes, ProviderError> {
        let what = format!("Drive download {file_id}");
        get_bytes(&self.retry, &what, || {
            self.download_request(credential, file_id, mime_type)
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for DriveAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Google
    }

    async fn list_page(
        &self,
        credential: &Credential,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<ListPage, ProviderError> {
        let list: FileList = get_json(&self.retry, "Drive listing", page_token.is_some(), || {
            self.list_request(credential, since, page_token)
        })
        .await?;

        let listed = list.files.len();
        let items: Vec<ArtifactRef> = list
            .files
            .into_iter()
            .filter(DriveFile::is_downloadable)
            .map(DriveFile::into_artifact)
            .collect();
        debug!("Drive page: {listed} files, {} downloadable", items.len());

        Ok(ListPage {
            items,
            next_page_token: list.next_page_token,
        })
    }

    async fn fetch_bytes(
        &self,
        credential: &Credential,
        artifact: &ArtifactRef,
    ) -> Result<Bytes, ProviderError> {
        self.fetch_file(credential, &artifact.artifact_id, artifact.mime_type.as_deref())
            .await
    }
}

/// Linked Drive files fetched with the Google lane's credential. A refusal
/// of one linked file fails only that artifact.
pub struct DriveLinks {
    drive: Arc<DriveAdapter>,
    tokens: Arc<TokenStore>,
}

impl DriveLinks {
    pub fn new(drive: Arc<DriveAdapter>, tokens: Arc<TokenStore>) -> Self {
        Self { drive, tokens }
    }
}

#[async_trait]
impl LinkedFiles for DriveLinks {
    async fn fetch_linked(
        &self,
        file_id: &str,
        mime_type: Option<&str>,
    ) -> Result<Bytes, ProviderError> {
        let credential = self
            .tokens
            .get_valid_credential(ProviderId::Google)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::ProviderUnavailable => ProviderError::Unavailable(e.to_string()),
                _ => ProviderError::Protocol(format!("no Google credential for linked file: {e}")),
            })?;
        match self.drive.fetch_file(&credential, file_id, mime_type).await {
            Err(ProviderError::Auth(msg)) => Err(ProviderError::Protocol(format!(
                "linked Drive file {file_id} refused: {msg}"
            ))),
            other => other,
        }
    }
}
