//! Pipeline orchestrator.
//!
//! One run: every provider lane authenticates, lists, normalizes and scores
//! concurrently; the surviving lanes' decisions go to the organizer in one
//! batch; cursors advance only after the organizer acknowledges it. A failed
//! lane keeps its cursor and the run is `degraded`. A failed commit or a
//! cancellation advances nothing.

pub mod lane;
pub mod organizer;
pub mod summary;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::TokenStore;
use crate::errors::{ErrorKind, PipelineError};
use crate::intake::IntakeCursor;
use crate::providers::ProviderAdapter;
use crate::screening::RuleSet;
use crate::store::StateStore;

use self::lane::{run_lane, LaneContext, LaneOutcome};
use self::organizer::{Organizer, OrganizerBatch};
use self::summary::{FatalError, RunCounts, RunStage, RunStatus, RunSummary};

pub use self::lane::PipelineOptions;

pub struct Pipeline {
    lane_ctx: Arc<LaneContext>,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    organizer: Arc<dyn Organizer>,
    store: Arc<dyn StateStore>,
    running: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn StateStore>,
        tokens: Arc<TokenStore>,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        organizer: Arc<dyn Organizer>,
        rule_set: Arc<RuleSet>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            lane_ctx: Arc::new(LaneContext {
                tokens,
                cursors: IntakeCursor::new(store.clone()),
                rule_set,
                options,
            }),
            adapters,
            organizer,
            store,
            running: Mutex::new(()),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.lane_ctx.tokens
    }

    pub fn cursors(&self) -> &IntakeCursor {
        &self.lane_ctx.cursors
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Runs now unless a run is already in flight, in which case `None`.
    pub async fn try_run(&self, cancel: CancellationToken) -> Option<RunSummary> {
        let _guard = self.running.try_lock().ok()?;
        Some(self.run_exclusive(cancel).await)
    }

    /// Waits for any in-flight run, then runs.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let _guard = self.running.lock().await;
        self.run_exclusive(cancel).await
    }

    async fn run_exclusive(&self, cancel: CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Run {run_id} started with {} provider lanes", self.adapters.len());

        let mut summary = self.execute(run_id, started_at, &cancel).await;
        summary.finished_at = Utc::now();

        if let Err(e) = self.store.record_run(&summary).await {
            error!("Failed to record run {run_id}: {e:#}");
        }
        info!(
            "Run {run_id} finished {}: {} listed, {} accepted, {} rejected, {} failed normalization",
            summary.status.as_str(),
            summary.counts.listed,
            summary.counts.accepted,
            summary.counts.rejected,
            summary.counts.normalization_failed
        );
        summary
    }

    async fn execute(
        &self,
        run_id: Uuid,
        started_at: chrono::DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let mut lanes = JoinSet::new();
        for adapter in &self.adapters {
            lanes.spawn(run_lane(self.lane_ctx.clone(), adapter.clone()));
        }

        let mut outcomes: Vec<LaneOutcome> = Vec::with_capacity(self.adapters.len());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Run {run_id} cancelled while lanes were running");
                    lanes.abort_all();
                    return aborted(run_id, started_at, outcomes);
                }
                joined = lanes.join_next() => match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => error!("Provider lane task failed: {e}"),
                    None => break,
                },
            }
        }
        if outcomes.len() < self.adapters.len() {
            let fatal = FatalError {
                kind: ErrorKind::ProviderProtocol,
                stage: RunStage::Scoring,
                message: "a provider lane crashed".to_string(),
            };
            return finish(run_id, started_at, RunStatus::Failed, outcomes, Some(fatal));
        }
        outcomes.sort_by_key(|o| o.summary.provider_id);

        let healthy = outcomes.iter().filter(|o| o.next_cursor.is_some()).count();
        if healthy == 0 {
            let fatal = outcomes.iter().find_map(|o| o.summary.fatal.clone());
            return finish(run_id, started_at, RunStatus::Failed, outcomes, fatal);
        }
        let status = if healthy == outcomes.len() {
            RunStatus::Completed
        } else {
            RunStatus::Degraded
        };

        let batch = build_batch(run_id, &outcomes);
        let committed = if batch.is_empty() {
            info!("Run {run_id}: nothing new to hand off");
            Ok(())
        } else {
            self.commit(&batch, cancel).await
        };

        if let Err(err) = committed {
            error!("Run {run_id} commit failed: {err}");
            let status = if matches!(err, PipelineError::Cancelled) {
                RunStatus::Aborted
            } else {
                RunStatus::Failed
            };
            let stage = if status == RunStatus::Aborted {
                RunStage::Aborted
            } else {
                RunStage::Failed
            };
            let fatal = FatalError {
                kind: err.kind(),
                stage: RunStage::Committing,
                message: err.to_string(),
            };
            for outcome in outcomes.iter_mut().filter(|o| o.next_cursor.is_some()) {
                outcome.summary.final_stage = stage;
            }
            return finish(run_id, started_at, status, outcomes, Some(fatal));
        }

        let mut store_error: Option<FatalError> = None;
        for outcome in outcomes.iter_mut() {
            let Some(next) = &outcome.next_cursor else {
                continue;
            };
            let provider = outcome.summary.provider_id;
            match self.lane_ctx.cursors.advance(provider, next).await {
                Ok(advanced) => {
                    outcome.summary.cursor_advanced = advanced;
                    outcome.summary.final_stage = RunStage::Idle;
                }
                Err(err) => {
                    error!("Run {run_id}: {provider} cursor not saved after commit: {err}");
                    let fatal = FatalError {
                        kind: err.kind(),
                        stage: RunStage::Committing,
                        message: err.to_string(),
                    };
                    outcome.summary.final_stage = RunStage::Failed;
                    outcome.summary.fatal = Some(fatal.clone());
                    store_error.get_or_insert(fatal);
                }
            }
        }

        match store_error {
            Some(fatal) => finish(run_id, started_at, RunStatus::Failed, outcomes, Some(fatal)),
            None => finish(run_id, started_at, status, outcomes, None),
        }
    }

    async fn commit(
        &self,
        batch: &OrganizerBatch,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let retry = self.lane_ctx.options.retry;
        let ack = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = retry.run("organizer commit", || self.organizer.commit(batch)) => {
                result.map_err(|e| PipelineError::OrganizerCommit(e.to_string()))?
            }
        };
        info!(
            "Run {} committed {} decisions and {} failures to {}",
            batch.run_id,
            batch.decisions.len(),
            batch.failures.len(),
            ack.location
        );
        Ok(())
    }
}

fn build_batch(run_id: Uuid, outcomes: &[LaneOutcome]) -> OrganizerBatch {
    let mut batch = OrganizerBatch {
        run_id,
        created_at: Utc::now(),
        decisions: Vec::new(),
        failures: Vec::new(),
        cursors: BTreeMap::new(),
    };
    for outcome in outcomes {
        let Some(next) = &outcome.next_cursor else {
            continue;
        };
        batch.decisions.extend(outcome.decisions.iter().cloned());
        batch.failures.extend(outcome.failures.iter().cloned());
        batch.cursors.insert(outcome.summary.provider_id, next.clone());
    }
    batch.decisions.sort_by(|a, b| {
        let a = &a.candidate_record.artifact_ref;
        let b = &b.candidate_record.artifact_ref;
        (a.provider_id, &a.artifact_id).cmp(&(b.provider_id, &b.artifact_id))
    });
    batch.failures.sort_by(|a, b| {
        let a = &a.artifact_ref;
        let b = &b.artifact_ref;
        (a.provider_id, &a.artifact_id).cmp(&(b.provider_id, &b.artifact_id))
    });
    batch
}

fn finish(
    run_id: Uuid,
    started_at: chrono::DateTime<Utc>,
    status: RunStatus,
    outcomes: Vec<LaneOutcome>,
    fatal: Option<FatalError>,
) -> RunSummary {
    let mut counts = RunCounts::default();
    for outcome in &outcomes {
        counts.add(&outcome.summary.counts);
    }
    RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        status,
        counts,
        lanes: outcomes.into_iter().map(|o| o.summary).collect(),
        fatal,
    }
}

fn aborted(
    run_id: Uuid,
    started_at: chrono::DateTime<Utc>,
    mut outcomes: Vec<LaneOutcome>,
) -> RunSummary {
    for outcome in outcomes.iter_mut().filter(|o| o.next_cursor.is_some()) {
        outcome.summary.final_stage = RunStage::Aborted;
    }
    let fatal = FatalError {
        kind: ErrorKind::Cancelled,
        stage: RunStage::Aborted,
        message: PipelineError::Cancelled.to_string(),
    };
    finish(run_id, started_at, RunStatus::Aborted, outcomes, Some(fatal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{credential, FakeExchanger};
    use crate::models::decision::Verdict;
    use crate::models::provider::ProviderId;
    use crate::pipeline::organizer::tests::RecordingOrganizer;
    use crate::providers::listing::tests::{artifact, FakeAdapter};
    use crate::providers::ProviderError;
    use crate::retry::RetryPolicy;
    use crate::screening::Rule;
    use crate::store::FileStateStore;
    use chrono::Duration;

    const STRONG: &[u8] = b"Ana Ruiz\nSkills: Python, Rust\n5 years of experience";
    const WEAK: &[u8] = b"Bo Chen\nSkills: Excel\n1 year of experience";

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<FileStateStore>,
        google: Arc<FakeAdapter>,
        microsoft: Arc<FakeAdapter>,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
        store
            .save_credential(&credential(ProviderId::Microsoft, "ms-live", 3600))
            .await
            .unwrap();
        Harness {
            _dir: dir,
            store,
            google: Arc::new(FakeAdapter::new(ProviderId::Google, 2)),
            microsoft: Arc::new(FakeAdapter::new(ProviderId::Microsoft, 2)),
        }
    }

    fn pipeline(h: &Harness, organizer: Arc<dyn Organizer>) -> Pipeline {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            call_timeout: std::time::Duration::from_secs(5),
        };
        let tokens = TokenStore::new(h.store.clone(), Duration::seconds(120), retry)
            .with_exchanger(Arc::new(FakeExchanger::new(ProviderId::Google, true)))
            .with_exchanger(Arc::new(FakeExchanger::new(ProviderId::Microsoft, false)));
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
        Pipeline::new(
            h.store.clone(),
            Arc::new(tokens),
            vec![h.google.clone(), h.microsoft.clone()],
            organizer,
            Arc::new(rule_set),
            PipelineOptions {
                overlap: Duration::minutes(5),
                worker_pool_size: 2,
                retry,
            },
        )
    }

    #[tokio::test]
    async fn test_run_commits_then_advances_cursors() {
        let h = harness().await;
        h.google.add(artifact(ProviderId::Google, "g1", 1), STRONG);
        h.google.add(artifact(ProviderId::Google, "g2", 2), WEAK);
        h.microsoft.add(artifact(ProviderId::Microsoft, "t/p/a", 3), STRONG);
        let organizer = Arc::new(RecordingOrganizer::default());
        let pipeline = pipeline(&h, organizer.clone());

        let summary = pipeline.run(CancellationToken::new()).await;

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.counts.listed, 3);
        // Same bytes on another provider are a separate delivery.
        assert_eq!(summary.counts.accepted, 2);
        assert_eq!(summary.counts.rejected, 1);
        assert!(summary.lanes.iter().all(|l| l.final_stage == RunStage::Idle));
        assert!(summary.lanes.iter().all(|l| l.cursor_advanced));

        let batches = organizer.batches();
        assert_eq!(batches.len(), 1);
        let keys: Vec<_> = batches[0]
            .decisions
            .iter()
            .map(|d| {
                let a = &d.candidate_record.artifact_ref;
                (a.provider_id, a.artifact_id.clone())
            })
            .collect();
        assert_eq!(
            keys,
            [
                (ProviderId::Google, "g1".to_string()),
                (ProviderId::Google, "g2".to_string()),
                (ProviderId::Microsoft, "t/p/a".to_string()),
            ]
        );
        assert_eq!(batches[0].decisions[0].verdict, Verdict::Accept);

        let cursor = h.store.load_cursor(ProviderId::Google).await.unwrap().unwrap();
        assert_eq!(batches[0].cursors[&ProviderId::Google], cursor);
        assert_eq!(h.store.latest_run().await.unwrap(), Some(summary));
    }

    #[tokio::test]
    async fn test_second_run_without_new_artifacts_is_idempotent() {
        let h = harness().await;
        h.google.add(artifact(ProviderId::Google, "g1", 1), STRONG);
        let organizer = Arc::new(RecordingOrganizer::default());
        let pipeline = pipeline(&h, organizer.clone());

        pipeline.run(CancellationToken::new()).await;
        let cursor_after_first = h.store.load_cursor(ProviderId::Google).await.unwrap();

        let second = pipeline.run(CancellationToken::new()).await;
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.counts.accepted + second.counts.rejected, 0);
        assert!(second.lanes.iter().all(|l| !l.cursor_advanced));
        assert_eq!(organizer.batches().len(), 1);
        assert_eq!(
            h.store.load_cursor(ProviderId::Google).await.unwrap(),
            cursor_after_first
        );
    }

    #[tokio::test]
    async fn test_new_artifacts_are_each_delivered_exactly_once() {
        let h = harness().await;
        h.google.add(artifact(ProviderId::Google, "g1", 1), STRONG);
        h.google.add(artifact(ProviderId::Google, "g2", 2), WEAK);
        let organizer = Arc::new(RecordingOrganizer::default());
        let pipeline = pipeline(&h, organizer.clone());
        pipeline.run(CancellationToken::new()).await;

        // Lands inside the overlap window, plus a binary that cannot be parsed.
        h.google.add(artifact(ProviderId::Google, "g0-late", 0), b"Cy Dee\nSkills: Python");
        h.google.add(artifact(ProviderId::Google, "g3", 3), &[0xD0, 0xCF, 0x11, 0xE0, 0x00]);
        // A renamed copy of g1 re-listed in the overlap, and a fresh upload of the same file.
        h.google.add(artifact(ProviderId::Google, "g1-copy", 1), STRONG);
        h.google.add(artifact(ProviderId::Google, "g4", 4), STRONG);
        pipeline.run(CancellationToken::new()).await;
        pipeline.run(CancellationToken::new()).await;

        let mut delivered: Vec<String> = organizer
            .batches()
            .iter()
            .flat_map(|b| {
                b.decisions
                    .iter()
                    .map(|d| d.candidate_record.artifact_ref.artifact_id.clone())
                    .chain(b.failures.iter().map(|f| f.artifact_ref.artifact_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        delivered.sort();
        assert_eq!(delivered, ["g0-late", "g1", "g2", "g3", "g4"]);
        assert_eq!(organizer.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_organizer_failure_leaves_cursors_untouched() {
        let h = harness().await;
        h.google.add(artifact(ProviderId::Google, "g1", 1), STRONG);
        let pipeline = pipeline(&h, Arc::new(RecordingOrganizer::failing()));

        let summary = pipeline.run(CancellationToken::new()).await;

        assert_eq!(summary.status, RunStatus::Failed);
        let fatal = summary.fatal.unwrap();
        assert_eq!(fatal.kind, ErrorKind::OrganizerCommit);
        assert_eq!(fatal.stage, RunStage::Committing);
        assert!(h.store.load_cursor(ProviderId::Google).await.unwrap().is_none());
        assert!(h.store.load_cursor(ProviderId::Microsoft).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_lane_degrades_run_and_keeps_its_cursor() {
        let h = harness().await;
        h.google.add(artifact(ProviderId::Google, "g1", 1), STRONG);
        h.microsoft.add(artifact(ProviderId::Microsoft, "t/p/a", 1), STRONG);
        h.microsoft
            .fail_next_list(ProviderError::Unavailable("503".to_string()));
        let organizer = Arc::new(RecordingOrganizer::default());
        let pipeline = pipeline(&h, organizer.clone());

        let summary = pipeline.run(CancellationToken::new()).await;

        assert_eq!(summary.status, RunStatus::Degraded);
        let ms = summary
            .lanes
            .iter()
            .find(|l| l.provider_id == ProviderId::Microsoft)
            .unwrap();
        assert_eq!(ms.fatal.as_ref().unwrap().kind, ErrorKind::ProviderUnavailable);
        assert_eq!(ms.final_stage, RunStage::Failed);
        assert!(h.store.load_cursor(ProviderId::Microsoft).await.unwrap().is_none());
        assert!(h.store.load_cursor(ProviderId::Google).await.unwrap().is_some());
        assert_eq!(organizer.batches()[0].decisions.len(), 1);
        assert!(!organizer.batches()[0].cursors.contains_key(&ProviderId::Microsoft));
    }

    #[tokio::test]
    async fn test_auth_expired_everywhere_fails_run() {
        let h = harness().await;
        h.store.delete_credential(ProviderId::Microsoft).await.unwrap();
        let organizer = Arc::new(RecordingOrganizer::default());
        let tokens = TokenStore::new(h.store.clone(), Duration::seconds(120), RetryPolicy::default())
            .with_exchanger(Arc::new(FakeExchanger::new(ProviderId::Microsoft, false)));
        let pipeline = Pipeline::new(
            h.store.clone(),
            Arc::new(tokens),
            vec![h.microsoft.clone()],
            organizer.clone(),
            Arc::new(RuleSet::default()),
            PipelineOptions::default(),
        );

        let summary = pipeline.run(CancellationToken::new()).await;

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.fatal.unwrap().kind, ErrorKind::AuthExpired);
        assert!(organizer.batches().is_empty());
        let recorded = h.store.latest_run().await.unwrap().unwrap();
        assert_eq!(recorded.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_aborted_without_commit() {
        let h = harness().await;
        h.google.add(artifact(ProviderId::Google, "g1", 1), STRONG);
        let organizer = Arc::new(RecordingOrganizer::default());
        let pipeline = pipeline(&h, organizer.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = pipeline.run(cancel).await;

        assert_eq!(summary.status, RunStatus::Aborted);
        assert_eq!(summary.fatal.unwrap().kind, ErrorKind::Cancelled);
        assert!(organizer.batches().is_empty());
        assert!(h.store.load_cursor(ProviderId::Google).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_try_run_refuses_concurrent_run() {
        let h = harness().await;
        let pipeline = pipeline(&h, Arc::new(RecordingOrganizer::default()));
        let _held = pipeline.running.lock().await;
        assert!(pipeline.try_run(CancellationToken::new()).await.is_none());
    }
}
