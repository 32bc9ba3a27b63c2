use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::TokenStore;
use crate::errors::PipelineError;
use crate::intake::IntakeCursor;
use crate::models::artifact::ArtifactRef;
use crate::models::candidate::{CandidateRecord, NormalizationFailure};
use crate::models::credential::Credential;
use crate::models::cursor::{CursorState, SeenArtifact};
use crate::models::decision::Decision;
use crate::models::provider::ProviderId;
use crate::normalize;
use crate::pipeline::summary::{FatalError, LaneSummary, RunCounts, RunStage};
use crate::providers::{Listing, ProviderAdapter, ProviderError};
use crate::retry::RetryPolicy;
use crate::screening::{evaluate, RuleSet};

/// Knobs shared by every lane of a run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub overlap: Duration,
    pub worker_pool_size: usize,
    /// Applied to the organizer commit. Provider calls carry their own.
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            overlap: Duration::seconds(300),
            worker_pool_size: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared collaborators of the lanes.
pub struct LaneContext {
    pub tokens: Arc<TokenStore>,
    pub cursors: IntakeCursor,
    pub rule_set: Arc<RuleSet>,
    pub options: PipelineOptions,
}

/// What a lane hands to the commit step.
#[derive(Debug)]
pub struct LaneOutcome {
    pub summary: LaneSummary,
    pub decisions: Vec<Decision>,
    pub failures: Vec<NormalizationFailure>,
    /// Position to commit after acknowledgement. `None` when the lane failed.
    pub next_cursor: Option<CursorState>,
}

struct Fetched {
    artifact: ArtifactRef,
    /// `None` when the provider refused the download.
    digest: Option<String>,
    normalized: Result<CandidateRecord, NormalizationFailure>,
}

/// Why a download task produced no `Fetched`.
enum FetchError {
    /// The provider refused this credential; retry once with a new one.
    Rejected(ArtifactRef, Credential),
    /// Fails the whole lane.
    Lane(PipelineError),
}

/// Tracks the lane's stage and enforces legal transitions.
struct StageTracker {
    provider: ProviderId,
    stage: RunStage,
}

impl StageTracker {
    fn advance(&mut self, next: RunStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.stage
        );
        debug!("{} lane: {:?} -> {next:?}", self.provider, self.stage);
        self.stage = next;
    }
}

pub async fn run_lane(ctx: Arc<LaneContext>, adapter: Arc<dyn ProviderAdapter>) -> LaneOutcome {
    let provider = adapter.provider();
    let mut tracker = StageTracker {
        provider,
        stage: RunStage::Idle,
    };
    let mut counts = RunCounts::default();

    match drive_lane(&ctx, adapter, &mut tracker, &mut counts).await {
        Ok((decisions, failures, next_cursor)) => LaneOutcome {
            summary: LaneSummary {
                provider_id: provider,
                final_stage: tracker.stage,
                counts,
                fatal: None,
                cursor_advanced: false,
            },
            decisions,
            failures,
            next_cursor: Some(next_cursor),
        },
        Err(err) => {
            warn!("{provider} lane failed during {:?}: {err}", tracker.stage);
            let fatal = FatalError {
                kind: err.kind(),
                stage: tracker.stage,
                message: err.to_string(),
            };
            tracker.advance(RunStage::Failed);
            LaneOutcome {
                summary: LaneSummary {
                    provider_id: provider,
                    final_stage: RunStage::Failed,
                    counts,
                    fatal: Some(fatal),
                    cursor_advanced: false,
                },
                decisions: Vec::new(),
                failures: Vec::new(),
                next_cursor: None,
            }
        }
    }
}

type LaneResult = (Vec<Decision>, Vec<NormalizationFailure>, CursorState);

async fn drive_lane(
    ctx: &LaneContext,
    adapter: Arc<dyn ProviderAdapter>,
    tracker: &mut StageTracker,
    counts: &mut RunCounts,
) -> Result<LaneResult, PipelineError> {
    let provider = adapter.provider();

    tracker.advance(RunStage::Authenticating);
    let mut credential = ctx.tokens.get_valid_credential(provider).await?;
    let cursor = ctx.cursors.current(provider).await?;
    let mut refreshed = false;

    tracker.advance(RunStage::Listing);
    let mut listing = Listing::new(
        adapter.clone(),
        cursor.clone(),
        ctx.options.overlap,
        credential.clone(),
    );
    let mut artifacts = Vec::new();
    loop {
        // A long listing can outlive the token it started with.
        if listing.needs_page() {
            credential = ctx.tokens.get_valid_credential(provider).await?;
            listing.set_credential(credential.clone());
        }
        match listing.next().await {
            Ok(Some(artifact)) => artifacts.push(artifact),
            Ok(None) => break,
            Err(ProviderError::Auth(msg)) if !refreshed => {
                debug!("{provider} listing rejected token: {msg}");
                ctx.tokens.force_refresh(provider, &credential).await?;
                refreshed = true;
            }
            Err(e) => return Err(e.into_pipeline(provider)),
        }
    }
    counts.listed = artifacts.len();
    counts.duplicates_skipped = listing.already_seen();
    info!("{provider} listed {} new artifacts", artifacts.len());

    tracker.advance(RunStage::Normalizing);
    let (mut fetched, rejected) = fetch_and_normalize(ctx, &adapter, artifacts).await?;
    if let Some((rejected_credential, auth_rejected)) = rejected {
        if refreshed {
            return Err(PipelineError::ProviderAuth {
                provider,
                message: "download rejected after refresh".to_string(),
            });
        }
        ctx.tokens.force_refresh(provider, &rejected_credential).await?;
        let (retried, still_rejected) = fetch_and_normalize(ctx, &adapter, auth_rejected).await?;
        if let Some((_, still_rejected)) = still_rejected {
            return Err(PipelineError::ProviderAuth {
                provider,
                message: format!("{} downloads rejected after refresh", still_rejected.len()),
            });
        }
        fetched.extend(retried);
    }

    // Content dedup applies only to re-listed overlap entries, which may be
    // renamed copies of something already delivered. Anything past the
    // cursor gets its own decision even when its bytes repeat.
    fetched.sort_by(|a, b| a.artifact.position().cmp(&b.artifact.position()));
    let mut processed = Vec::with_capacity(fetched.len());
    let mut digests_this_run = HashSet::new();
    let mut records = Vec::new();
    let mut failures = Vec::new();
    for item in fetched {
        processed.push(SeenArtifact {
            artifact_id: item.artifact.artifact_id.clone(),
            digest: item.digest.clone(),
            provider_hash: item.artifact.content_hash.clone(),
            source_timestamp: item.artifact.source_timestamp,
        });
        let relisted = cursor
            .last_seen_timestamp
            .is_some_and(|last| item.artifact.source_timestamp <= last);
        if let Some(digest) = item.digest {
            let repeat = cursor.has_seen_digest(&digest) || digests_this_run.contains(&digest);
            if relisted && repeat {
                debug!("{provider} skipping re-listed copy {}", item.artifact.artifact_id);
                counts.duplicates_skipped += 1;
                continue;
            }
            digests_this_run.insert(digest);
        }
        match item.normalized {
            Ok(record) => records.push(record),
            Err(failure) => {
                warn!(
                    "{provider} could not normalize {}: {}",
                    failure.artifact_ref.artifact_id, failure.reason
                );
                failures.push(failure);
            }
        }
    }
    counts.normalized = records.len();
    counts.normalization_failed = failures.len();

    tracker.advance(RunStage::Scoring);
    let mut decisions: Vec<Decision> = records
        .iter()
        .map(|record| evaluate(record, &ctx.rule_set))
        .collect();
    decisions.sort_by(|a, b| {
        a.candidate_record
            .artifact_ref
            .artifact_id
            .cmp(&b.candidate_record.artifact_ref.artifact_id)
    });
    failures.sort_by(|a, b| a.artifact_ref.artifact_id.cmp(&b.artifact_ref.artifact_id));
    counts.accepted = decisions.iter().filter(|d| d.is_accepted()).count();
    counts.rejected = decisions.len() - counts.accepted;

    let next_cursor = cursor.advanced_by(&processed, ctx.options.overlap);
    Ok((decisions, failures, next_cursor))
}

/// Artifacts whose download was refused with an auth error, with the
/// credential that was refused.
type AuthRejected = Option<(Credential, Vec<ArtifactRef>)>;

/// Downloads and normalizes on a bounded pool. Each download asks the token
/// store for a credential first. A download refused for that one artifact
/// becomes its failure record; a provider outage fails the lane.
async fn fetch_and_normalize(
    ctx: &LaneContext,
    adapter: &Arc<dyn ProviderAdapter>,
    artifacts: Vec<ArtifactRef>,
) -> Result<(Vec<Fetched>, AuthRejected), PipelineError> {
    let provider = adapter.provider();
    let permits = Arc::new(Semaphore::new(ctx.options.worker_pool_size.max(1)));
    let mut tasks = JoinSet::new();

    for artifact in artifacts {
        let permits = permits.clone();
        let adapter = adapter.clone();
        let tokens = ctx.tokens.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| {
                FetchError::Lane(PipelineError::ProviderUnavailable {
                    provider,
                    message: "worker pool closed".to_string(),
                })
            })?;
            let credential = tokens
                .get_valid_credential(provider)
                .await
                .map_err(FetchError::Lane)?;

            let bytes: Bytes = match adapter.fetch_bytes(&credential, &artifact).await {
                Ok(bytes) => bytes,
                Err(ProviderError::Auth(_)) => {
                    return Err(FetchError::Rejected(artifact, credential));
                }
                Err(ProviderError::Protocol(reason)) => {
                    warn!("{provider} download of {} refused: {reason}", artifact.artifact_id);
                    return Ok(Fetched {
                        normalized: Err(NormalizationFailure {
                            artifact_ref: artifact.clone(),
                            raw_bytes_digest: None,
                            reason: format!("download failed: {reason}"),
                        }),
                        artifact,
                        digest: None,
                    });
                }
                Err(err) => return Err(FetchError::Lane(err.into_pipeline(provider))),
            };

            let digest = normalize::digest(&bytes);
            let to_normalize = artifact.clone();
            let normalized =
                tokio::task::spawn_blocking(move || normalize::normalize(&to_normalize, &bytes))
                    .await
                    .unwrap_or_else(|join_err| {
                        Err(NormalizationFailure {
                            artifact_ref: artifact.clone(),
                            raw_bytes_digest: Some(digest.clone()),
                            reason: format!("extractor crashed: {join_err}"),
                        })
                    });
            Ok(Fetched {
                artifact,
                digest: Some(digest),
                normalized,
            })
        });
    }

    let mut fetched = Vec::new();
    let mut rejected: AuthRejected = None;
    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(item)) => fetched.push(item),
            Ok(Err(FetchError::Rejected(artifact, credential))) => {
                rejected
                    .get_or_insert_with(|| (credential, Vec::new()))
                    .1
                    .push(artifact);
            }
            Ok(Err(FetchError::Lane(err))) => {
                warn!("{provider} download failed: {err}");
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                first_error.get_or_insert(PipelineError::ProviderProtocol {
                    provider,
                    message: format!("download task failed: {join_err}"),
                });
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok((fetched, rejected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::exchange::TokenExchanger;
    use crate::auth::tests::{credential, FakeExchanger};
    use crate::errors::ErrorKind;
    use crate::models::decision::Verdict;
    use crate::providers::listing::tests::{artifact, FakeAdapter};
    use crate::providers::ListPage;
    use crate::screening::Rule;
    use crate::store::{FileStateStore, StateStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<FileStateStore>,
        ctx: Arc<LaneContext>,
    }

    async fn harness(exchanger: FakeExchanger) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
        let provider = exchanger.provider();
        store
            .save_credential(&credential(provider, "token-live", 3600))
            .await
            .unwrap();
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            call_timeout: std::time::Duration::from_secs(5),
        };
        let tokens = TokenStore::new(store.clone(), Duration::seconds(120), retry)
            .with_exchanger(Arc::new(exchanger));
        let rule_set = RuleSet::new(
            0.5,
            vec![
                Rule::RequiredSkill {
                    skill: "python".to_string(),
                    weight: 0.6,
                },
                Rule::MinExperience {
                    years: 3.0,
                    weight: 0.4,
                },
            ],
        )
        .unwrap();
        let ctx = Arc::new(LaneContext {
            tokens: Arc::new(tokens),
            cursors: IntakeCursor::new(store.clone()),
            rule_set: Arc::new(rule_set),
            options: PipelineOptions {
                overlap: Duration::minutes(5),
                worker_pool_size: 2,
                retry,
            },
        });
        Harness {
            _dir: dir,
            store,
            ctx,
        }
    }

    const STRONG: &[u8] = b"Ana Ruiz\nSkills: Python, Rust\n5 years of experience";
    const WEAK: &[u8] = b"Bo Chen\nSkills: Excel\n1 year of experience";

    #[tokio::test]
    async fn test_lane_scores_and_proposes_cursor() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Google, 2));
        adapter.add(artifact(ProviderId::Google, "b-weak", 2), WEAK);
        adapter.add(artifact(ProviderId::Google, "a-strong", 1), STRONG);
        adapter.add(artifact(ProviderId::Google, "c-binary", 3), &[0xD0, 0xCF, 0x11, 0xE0, 0x00]);

        let outcome = run_lane(h.ctx.clone(), adapter.clone()).await;

        assert!(outcome.summary.fatal.is_none());
        assert_eq!(outcome.summary.final_stage, RunStage::Scoring);
        assert_eq!(outcome.summary.counts.listed, 3);
        assert_eq!(outcome.summary.counts.accepted, 1);
        assert_eq!(outcome.summary.counts.rejected, 1);
        assert_eq!(outcome.summary.counts.normalization_failed, 1);

        let ids: Vec<_> = outcome
            .decisions
            .iter()
            .map(|d| d.candidate_record.artifact_ref.artifact_id.as_str())
            .collect();
        assert_eq!(ids, ["a-strong", "b-weak"]);
        assert_eq!(outcome.decisions[0].verdict, Verdict::Accept);
        assert_eq!(outcome.failures[0].artifact_ref.artifact_id, "c-binary");

        let next = outcome.next_cursor.unwrap();
        assert_eq!(next.last_seen_artifact_id.as_deref(), Some("c-binary"));
        assert_eq!(next.recent.len(), 3);
        // Nothing is committed by the lane itself.
        assert!(h.store.load_cursor(ProviderId::Google).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_bytes_are_only_skipped_inside_the_overlap() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Google, 10));
        adapter.add(artifact(ProviderId::Google, "first", 2), STRONG);
        adapter.add(artifact(ProviderId::Google, "second", 3), STRONG);

        // Both are past the cursor, so both are decided.
        let outcome = run_lane(h.ctx.clone(), adapter.clone()).await;
        assert_eq!(outcome.decisions.len(), 2);
        assert_eq!(outcome.summary.counts.duplicates_skipped, 0);
        let next = outcome.next_cursor.unwrap();
        h.ctx.cursors.advance(ProviderId::Google, &next).await.unwrap();

        // A renamed copy re-listed inside the overlap is skipped; a new
        // upload with the same bytes is still decided.
        adapter.add(artifact(ProviderId::Google, "copy", 1), STRONG);
        adapter.add(artifact(ProviderId::Google, "resent", 9), STRONG);
        let outcome = run_lane(h.ctx.clone(), adapter).await;
        let ids: Vec<_> = outcome
            .decisions
            .iter()
            .map(|d| d.candidate_record.artifact_ref.artifact_id.as_str())
            .collect();
        assert_eq!(ids, ["resent"]);
        // "first" and "second" by id, "copy" by content.
        assert_eq!(outcome.summary.counts.duplicates_skipped, 3);
    }

    #[tokio::test]
    async fn test_auth_rejection_refreshes_once() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Google, 10));
        adapter.add(artifact(ProviderId::Google, "a", 1), STRONG);
        adapter.fail_next_list(ProviderError::Auth("401".to_string()));

        let outcome = run_lane(h.ctx.clone(), adapter.clone()).await;
        assert!(outcome.summary.fatal.is_none());
        assert_eq!(outcome.decisions.len(), 1);
        let calls = adapter.list_calls.lock().unwrap();
        assert_eq!(calls[0].2, "token-live");
        assert_eq!(calls[1].2, "access-1");
    }

    #[tokio::test]
    async fn test_repeated_auth_rejection_fails_lane() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Google, 10));
        adapter.add(artifact(ProviderId::Google, "a", 1), STRONG);
        adapter.fail_next_list(ProviderError::Auth("401".to_string()));
        adapter.fail_next_list(ProviderError::Auth("401".to_string()));

        let outcome = run_lane(h.ctx.clone(), adapter).await;
        let fatal = outcome.summary.fatal.unwrap();
        assert_eq!(fatal.kind, ErrorKind::ProviderAuth);
        assert_eq!(fatal.stage, RunStage::Listing);
        assert_eq!(outcome.summary.final_stage, RunStage::Failed);
        assert!(outcome.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_refused_download_is_reported_and_lane_continues() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Google, 10));
        adapter.add(artifact(ProviderId::Google, "a", 1), STRONG);
        adapter.add(artifact(ProviderId::Google, "b", 2), WEAK);
        adapter.fail_next_fetch("a", ProviderError::Protocol("status 404 Not Found".to_string()));

        let outcome = run_lane(h.ctx.clone(), adapter.clone()).await;
        assert!(outcome.summary.fatal.is_none());
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.summary.counts.normalization_failed, 1);
        let failure = &outcome.failures[0];
        assert_eq!(failure.artifact_ref.artifact_id, "a");
        assert_eq!(failure.raw_bytes_digest, None);
        assert!(failure.reason.starts_with("download failed"));

        // The refused artifact is behind the committed cursor and is not fetched again.
        let next = outcome.next_cursor.unwrap();
        assert_eq!(next.last_seen_artifact_id.as_deref(), Some("b"));
        h.ctx.cursors.advance(ProviderId::Google, &next).await.unwrap();
        let outcome = run_lane(h.ctx.clone(), adapter.clone()).await;
        assert!(outcome.decisions.is_empty() && outcome.failures.is_empty());
        let fetches = adapter.fetch_calls.lock().unwrap();
        assert_eq!(fetches.iter().filter(|id| *id == "a").count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_download_fails_lane() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Google, 10));
        adapter.add(artifact(ProviderId::Google, "a", 1), STRONG);
        adapter.fail_next_fetch("a", ProviderError::Unavailable("503".to_string()));

        let outcome = run_lane(h.ctx.clone(), adapter).await;
        let fatal = outcome.summary.fatal.unwrap();
        assert_eq!(fatal.kind, ErrorKind::ProviderUnavailable);
        assert_eq!(fatal.stage, RunStage::Normalizing);
        assert!(outcome.decisions.is_empty());
        assert!(outcome.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_download_auth_rejection_refreshes_once() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Google, 10));
        adapter.add(artifact(ProviderId::Google, "a", 1), STRONG);
        adapter.fail_next_fetch("a", ProviderError::Auth("401".to_string()));

        let outcome = run_lane(h.ctx.clone(), adapter.clone()).await;
        assert!(outcome.summary.fatal.is_none());
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(adapter.fetch_calls.lock().unwrap().len(), 2);
    }

    /// Lets the stored credential drift into the refresh skew after the
    /// first listing page, as a long listing would.
    struct ExpiresAfterFirstPage {
        inner: Arc<FakeAdapter>,
        store: Arc<FileStateStore>,
        expired: AtomicBool,
    }

    #[async_trait]
    impl ProviderAdapter for ExpiresAfterFirstPage {
        fn provider(&self) -> ProviderId {
            self.inner.provider
        }

        async fn list_page(
            &self,
            current: &Credential,
            since: Option<DateTime<Utc>>,
            page_token: Option<&str>,
        ) -> Result<ListPage, ProviderError> {
            let page = self.inner.list_page(current, since, page_token).await;
            if !self.expired.swap(true, Ordering::SeqCst) {
                self.store
                    .save_credential(&credential(self.inner.provider, "token-expiring", 60))
                    .await
                    .unwrap();
            }
            page
        }

        async fn fetch_bytes(
            &self,
            current: &Credential,
            artifact: &ArtifactRef,
        ) -> Result<Bytes, ProviderError> {
            self.inner.fetch_bytes(current, artifact).await
        }
    }

    #[tokio::test]
    async fn test_credential_expiring_mid_listing_is_refreshed_before_next_page() {
        let h = harness(FakeExchanger::new(ProviderId::Google, true)).await;
        let inner = Arc::new(FakeAdapter::new(ProviderId::Google, 1));
        inner.add(artifact(ProviderId::Google, "a", 1), STRONG);
        inner.add(artifact(ProviderId::Google, "b", 2), WEAK);
        let adapter = Arc::new(ExpiresAfterFirstPage {
            inner: inner.clone(),
            store: h.store.clone(),
            expired: AtomicBool::new(false),
        });

        let outcome = run_lane(h.ctx.clone(), adapter).await;
        assert!(outcome.summary.fatal.is_none());
        assert_eq!(outcome.decisions.len(), 2);
        let tokens: Vec<_> = inner
            .list_calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.2.clone())
            .collect();
        assert_eq!(tokens, ["token-live", "access-1"]);
    }

    #[tokio::test]
    async fn test_missing_consent_fails_in_authenticating() {
        let h = harness(FakeExchanger::new(ProviderId::Microsoft, false)).await;
        h.ctx.tokens.revoke(ProviderId::Microsoft).await.unwrap();
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Microsoft, 10));

        let outcome = run_lane(h.ctx.clone(), adapter.clone()).await;
        let fatal = outcome.summary.fatal.unwrap();
        assert_eq!(fatal.kind, ErrorKind::AuthExpired);
        assert_eq!(fatal.stage, RunStage::Authenticating);
        assert!(adapter.list_calls.lock().unwrap().is_empty());
    }
}
