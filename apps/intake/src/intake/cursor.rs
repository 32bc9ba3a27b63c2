use std::sync::Arc;

use tracing::info;

use crate::errors::PipelineError;
use crate::models::cursor::CursorState;
use crate::models::provider::ProviderId;
use crate::store::StateStore;

/// Reads and commits cursor positions. A position is only ever replaced by
/// one that is not behind it.
#[derive(Clone)]
pub struct IntakeCursor {
    store: Arc<dyn StateStore>,
}

impl IntakeCursor {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Last durably committed position; beginning of time on first run.
    pub async fn current(&self, provider: ProviderId) -> Result<CursorState, PipelineError> {
        let stored = self
            .store
            .load_cursor(provider)
            .await
            .map_err(PipelineError::Store)?;
        Ok(stored.unwrap_or_else(|| CursorState::beginning(provider)))
    }

    /// Durably commits `next`. Returns `false` when it equals the current
    /// position and nothing was written.
    pub async fn advance(
        &self,
        provider: ProviderId,
        next: &CursorState,
    ) -> Result<bool, PipelineError> {
        if next.provider_id != provider {
            return Err(PipelineError::Store(anyhow::anyhow!(
                "cursor for {} offered to {provider}",
                next.provider_id
            )));
        }
        let current = self.current(provider).await?;
        if &current == next {
            return Ok(false);
        }
        let regressed = match (
            current.last_seen_timestamp,
            current.last_seen_artifact_id.as_deref(),
            next.last_seen_timestamp,
            next.last_seen_artifact_id.as_deref(),
        ) {
            (Some(cur_ts), cur_id, Some(next_ts), next_id) => {
                (next_ts, next_id.unwrap_or_default()) < (cur_ts, cur_id.unwrap_or_default())
            }
            (Some(_), _, None, _) => true,
            (None, _, _, _) => false,
        };
        if regressed {
            return Err(PipelineError::Store(anyhow::anyhow!(
                "refusing to move {provider} cursor backwards"
            )));
        }

        self.store
            .save_cursor(next)
            .await
            .map_err(PipelineError::Store)?;
        info!(
            "Advanced {provider} cursor to {:?} ({:?})",
            next.last_seen_timestamp, next.last_seen_artifact_id
        );
        Ok(true)
    }
}
