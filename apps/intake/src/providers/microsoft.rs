use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::models::artifact::ArtifactRef;
use crate::models::credential::Credential;
use crate::models::provider::ProviderId;
use crate::providers::google::GOOGLE_DOC;
use crate::providers::{
    get_bytes, get_json, query_timestamp, LinkedFiles, ListPage, ProviderAdapter, ProviderError,
};
use crate::retry::RetryPolicy;

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const THREADS_PAGE_SIZE: &str = "50";
const FILE_ATTACHMENT: &str = "#microsoft.graph.fileAttachment";
/// Marks the last artifact id segment of a linked Drive file.
const DRIVE_LINK_PREFIX: &str = "drive:";

const RESUME_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];
const RESUME_EXTENSIONS: &[&str] = &[".pdf", ".docx", ".txt"];

#[derive(Debug, Deserialize)]
struct GraphCollection<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Thread {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    content_type: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Post {
    id: String,
    #[serde(default)]
    has_attachments: bool,
    received_date_time: Option<DateTime<Utc>>,
    created_date_time: Option<DateTime<Utc>>,
    body: Option<ItemBody>,
}

impl Post {
    fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.received_date_time.or(self.created_date_time)
    }

    /// Body as plain text, `None` when blank.
    fn text(&self) -> Option<String> {
        let body = self.body.as_ref()?;
        let text = if body
            .content_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("html"))
        {
            html_to_text(&body.content)
        } else {
            body.content.clone()
        };
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    fn drive_links(&self) -> Vec<DriveLink> {
        self.body
            .as_ref()
            .map(|b| drive_links(&b.content))
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attachment {
    id: String,
    #[serde(rename = "@odata.type")]
    odata_type: Option<String>,
    name: Option<String>,
    content_type: Option<String>,
    #[serde(default)]
    is_inline: bool,
}

impl Attachment {
    /// Downloadable file that plausibly holds a resume. Inline images and
    /// item/reference attachments are skipped.
    fn is_resume_candidate(&self) -> bool {
        if self.is_inline {
            return false;
        }
        if self.odata_type.as_deref().is_some_and(|t| t != FILE_ATTACHMENT) {
            return false;
        }
        let by_type = self
            .content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
            .is_some_and(|ct| RESUME_CONTENT_TYPES.contains(&ct.as_str()));
        let by_name = self.name.as_deref().is_some_and(|n| {
            let n = n.to_ascii_lowercase();
            RESUME_EXTENSIONS.iter().any(|ext| n.ends_with(ext))
        });
        by_type || by_name
    }
}

/// A Google Drive file referenced from a post body.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DriveLink {
    file_id: String,
    google_doc: bool,
}

fn drive_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"https?://(?:drive|docs)\.google\.com/(?:(file|document)/d/|open\?id=)([A-Za-z0-9_-]{10,})",
        )
        .expect("drive link regex")
    })
}

/// Drive file ids linked from `content`, first occurrence first.
fn drive_links(content: &str) -> Vec<DriveLink> {
    let mut links: Vec<DriveLink> = Vec::new();
    for caps in drive_link_re().captures_iter(content) {
        let file_id = caps[2].to_string();
        if links.iter().any(|l| l.file_id == file_id) {
            continue;
        }
        links.push(DriveLink {
            file_id,
            google_doc: caps.get(1).is_some_and(|m| m.as_str() == "document"),
        });
    }
    links
}

fn html_to_text(html: &str) -> String {
    static HIDDEN: OnceLock<Regex> = OnceLock::new();
    static BREAKS: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();
    let hidden = HIDDEN.get_or_init(|| {
        Regex::new(r"(?is)<style[^>]*>.*?</style>|<script[^>]*>.*?</script>|<head[^>]*>.*?</head>")
            .expect("hidden html regex")
    });
    let breaks = BREAKS.get_or_init(|| {
        Regex::new(r"(?i)<br\s*/?>|</(?:p|div|li|tr|h[1-6])\s*>").expect("html break regex")
    });
    let tags = TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("html tag regex"));

    let visible = hidden.replace_all(html, "");
    let lined = breaks.replace_all(&visible, "\n");
    tags.replace_all(&lined, "")
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Microsoft 365 group mailbox over Graph: conversation threads, their posts,
/// the posts' file attachments and, when a Drive source is attached, the
/// Google Drive files the posts link to.
///
/// One listing page is one page of threads, expanded to attachment level.
/// Artifact ids are `{thread}/{post}/{attachment}` or
/// `{thread}/{post}/drive:{file}`.
pub struct GraphGroupAdapter {
    client: Client,
    base_url: String,
    group_id: String,
    retry: RetryPolicy,
    linked: Option<Arc<dyn LinkedFiles>>,
}

impl GraphGroupAdapter {
    pub fn new(client: Client, group_id: String) -> Self {
        Self {
            client,
            base_url: GRAPH_BASE_URL.to_string(),
            group_id,
            retry: RetryPolicy::default(),
            linked: None,
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

    /// Lists Drive files linked from post bodies and downloads them through
    /// `linked`. Without it, links are ignored.
    pub fn with_linked_files(mut self, linked: Arc<dyn LinkedFiles>) -> Self {
        self.linked = Some(linked);
        self
    }

    /// `{base}/groups/{group}/threads/...` with every segment percent-encoded.
    fn group_url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::Protocol(format!("bad Graph base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Protocol("Graph base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("groups")
            .push(&self.group_id)
            .extend(segments);
        Ok(url)
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: Url,
        paging: bool,
    ) -> Result<T, ProviderError> {
        let what = format!("Graph GET {}", url.path());
        get_json(&self.retry, &what, paging, || {
            self.client
                .get(url.clone())
                .bearer_auth(&credential.access_token)
        })
        .await
    }

    /// Follows `@odata.nextLink` to the end of a collection.
    async fn fetch_all<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        first: Url,
    ) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let page: GraphCollection<T> = self.fetch_json(credential, url, false).await?;
            items.extend(page.value);
            next = page
                .next_link
                .map(|link| Url::parse(&link))
                .transpose()
                .map_err(|e| ProviderError::Protocol(format!("bad nextLink: {e}")))?;
        }
        Ok(items)
    }

    fn threads_url(&self, since: Option<DateTime<Utc>>) -> Result<Url, ProviderError> {
        let mut url = self.group_url(&["threads"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("$top", THREADS_PAGE_SIZE);
            if let Some(since) = since {
                query.append_pair(
                    "$filter",
                    &format!("lastDeliveredDateTime ge {}", query_timestamp(since)),
                );
            }
        }
        Ok(url)
    }

    async fn thread_artifacts(
        &self,
        credential: &Credential,
        thread: &Thread,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ArtifactRef>, ProviderError> {
        let posts: Vec<Post> = self
            .fetch_all(credential, self.group_url(&["threads", &thread.id, "posts"])?)
            .await?;

        let mut artifacts = Vec::new();
        for post in &posts {
            let links = match self.linked {
                Some(_) => post.drive_links(),
                None => Vec::new(),
            };
            if !post.has_attachments && links.is_empty() {
                continue;
            }
            let Some(delivered_at) = post.delivered_at() else {
                return Err(ProviderError::Protocol(format!(
                    "post {} has no delivery timestamp",
                    post.id
                )));
            };
            if since.is_some_and(|s| delivered_at < s) {
                continue;
            }
            let origin = Origin {
                thread_id: &thread.id,
                post_id: &post.id,
                delivered_at,
                message_text: post.text(),
            };

            if post.has_attachments {
                let mut url =
                    self.group_url(&["threads", &thread.id, "posts", &post.id, "attachments"])?;
                url.query_pairs_mut()
                    .append_pair("$select", "id,name,contentType,isInline");
                let attachments: Vec<Attachment> = self.fetch_all(credential, url).await?;
                artifacts.extend(
                    attachments
                        .into_iter()
                        .filter(Attachment::is_resume_candidate)
                        .map(|a| origin.attachment(a)),
                );
            }
            artifacts.extend(links.into_iter().map(|link| origin.drive_link(link)));
        }
        Ok(artifacts)
    }
}

/// The post an artifact was found in.
struct Origin<'a> {
    thread_id: &'a str,
    post_id: &'a str,
    delivered_at: DateTime<Utc>,
    message_text: Option<String>,
}

impl Origin<'_> {
    fn artifact(&self, last_segment: &str) -> ArtifactRef {
        ArtifactRef {
            provider_id: ProviderId::Microsoft,
            artifact_id: format!("{}/{}/{last_segment}", self.thread_id, self.post_id),
            source_timestamp: self.delivered_at,
            content_hash: None,
            name: None,
            mime_type: None,
            message_text: self.message_text.clone(),
        }
    }

    fn attachment(&self, attachment: Attachment) -> ArtifactRef {
        ArtifactRef {
            name: attachment.name,
            mime_type: attachment.content_type,
            ..self.artifact(&attachment.id)
        }
    }

    fn drive_link(&self, link: DriveLink) -> ArtifactRef {
        ArtifactRef {
            mime_type: link.google_doc.then(|| GOOGLE_DOC.to_string()),
            ..self.artifact(&format!("{DRIVE_LINK_PREFIX}{}", link.file_id))
        }
    }
}

fn split_artifact_id(artifact_id: &str) -> Result<(&str, &str, &str), ProviderError> {
    let mut parts = artifact_id.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(t), Some(p), Some(a)) if !t.is_empty() && !p.is_empty() && !a.is_empty() => {
            Ok((t, p, a))
        }
        _ => Err(ProviderError::Protocol(format!(
            "not a Graph attachment id: {artifact_id}"
        ))),
    }
}

#[async_trait]
impl ProviderAdapter for GraphGroupAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Microsoft
    }

    async fn list_page(
        &self,
        credential: &Credential,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<ListPage, ProviderError> {
        let (url, paging) = match page_token {
            Some(link) => (
                Url::parse(link).map_err(|_| ProviderError::PageTokenExpired)?,
                true,
            ),
            None => (self.threads_url(since)?, false),
        };
        let threads: GraphCollection<Thread> = self.fetch_json(credential, url, paging).await?;

        let mut items = Vec::new();
        for thread in &threads.value {
            items.extend(self.thread_artifacts(credential, thread, since).await?);
        }
        debug!(
            "Graph threads page: {} threads, {} artifacts",
            threads.value.len(),
            items.len()
        );

        Ok(ListPage {
            items,
            next_page_token: threads.next_link,
        })
    }

    async fn fetch_bytes(
        &self,
        credential: &Credential,
        artifact: &ArtifactRef,
    ) -> Result<Bytes, ProviderError> {
        let (thread, post, attachment) = split_artifact_id(&artifact.artifact_id)?;
        if let Some(file_id) = attachment.strip_prefix(DRIVE_LINK_PREFIX) {
            let Some(linked) = &self.linked else {
                return Err(ProviderError::Protocol(format!(
                    "no Drive source for linked file {file_id}"
                )));
            };
            return linked
                .fetch_linked(file_id, artifact.mime_type.as_deref())
                .await;
        }

        let url = self.group_url(&[
            "threads",
            thread,
            "posts",
            post,
            "attachments",
            attachment,
            "$value",
        ])?;
        let what = format!("Graph download {}", artifact.artifact_id);
        get_bytes(&self.retry, &what, || {
            self.client
                .get(url.clone())
                .bearer_auth(&credential.access_token)
        })
        .await
    }
}
