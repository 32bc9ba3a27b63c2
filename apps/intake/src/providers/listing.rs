use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::models::artifact::ArtifactRef;
use crate::models::credential::Credential;
use crate::models::cursor::CursorState;
use crate::providers::{ProviderAdapter, ProviderError};

/// Consecutive page-token expiries tolerated before giving up on a listing.
const MAX_RELISTS: u32 = 3;

/// Lazy, finite sequence of artifacts new since a cursor.
///
/// Listing starts at `last_seen_timestamp - overlap` and drops entries the
/// cursor already recorded. Pages are fetched on demand. If the provider
/// expires the page token mid-way, the listing restarts from the window start
/// and skips ids it already yielded.
///
/// Retries and timeouts belong to the adapter, per HTTP request. Errors from
/// a page surface here unchanged and the position is kept, so the caller can
/// swap the credential and call [`Listing::next`] again.
pub struct Listing {
    adapter: Arc<dyn ProviderAdapter>,
    credential: Credential,
    cursor: CursorState,
    since: Option<DateTime<Utc>>,
    page_token: Option<String>,
    buffered: VecDeque<ArtifactRef>,
    yielded: HashSet<String>,
    exhausted: bool,
    relists: u32,
    already_seen: usize,
}

impl Listing {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        cursor: CursorState,
        overlap: Duration,
        credential: Credential,
    ) -> Self {
        let since = cursor.window_start(overlap);
        Self {
            adapter,
            credential,
            cursor,
            since,
            page_token: None,
            buffered: VecDeque::new(),
            yielded: HashSet::new(),
            exhausted: false,
            relists: 0,
            already_seen: 0,
        }
    }

    /// Swaps in a refreshed credential. The position is kept.
    pub fn set_credential(&mut self, credential: Credential) {
        self.credential = credential;
    }

    /// True when the next call to [`Listing::next`] will request a page.
    pub fn needs_page(&self) -> bool {
        self.buffered.is_empty() && !self.exhausted
    }

    /// Entries dropped because the cursor had already recorded them.
    pub fn already_seen(&self) -> usize {
        self.already_seen
    }

    pub async fn next(&mut self) -> Result<Option<ArtifactRef>, ProviderError> {
        loop {
            if let Some(artifact) = self.buffered.pop_front() {
                return Ok(Some(artifact));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<(), ProviderError> {
        let provider = self.adapter.provider();
        let result = self
            .adapter
            .list_page(&self.credential, self.since, self.page_token.as_deref())
            .await;

        let page = match result {
            Ok(page) => page,
            Err(ProviderError::PageTokenExpired) if self.page_token.is_some() => {
                self.relists += 1;
                if self.relists > MAX_RELISTS {
                    return Err(ProviderError::Protocol(format!(
                        "page token expired {MAX_RELISTS} times in a row"
                    )));
                }
                warn!(
                    "{provider} page token expired, re-listing from {:?}",
                    self.since
                );
                self.page_token = None;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.relists = 0;
        let listed = page.items.len();
        for artifact in page.items {
            if !self.yielded.insert(artifact.artifact_id.clone()) {
                continue;
            }
            if self.cursor.has_seen(&artifact) {
                self.already_seen += 1;
                continue;
            }
            self.buffered.push_back(artifact);
        }
        debug!(
            "{provider} page: {listed} listed, {} new",
            self.buffered.len()
        );

        self.exhausted = page.next_page_token.is_none();
        self.page_token = page.next_page_token;
        Ok(())
    }

    /// Drains the listing.
    pub async fn collect(mut self) -> Result<Vec<ArtifactRef>, ProviderError> {
        let mut all = Vec::new();
        while let Some(artifact) = self.next().await? {
            all.push(artifact);
        }
        Ok(all)
    }
}
