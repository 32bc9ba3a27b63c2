use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::candidate::NormalizationFailure;
use crate::models::cursor::CursorState;
use crate::models::decision::Decision;
use crate::models::provider::ProviderId;
use crate::retry::Retryable;

/// Everything one run hands to the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizerBatch {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Sorted by `(provider, artifact_id)`.
    pub decisions: Vec<Decision>,
    /// Sorted by `(provider, artifact_id)`.
    pub failures: Vec<NormalizationFailure>,
    /// Positions the committing lanes will advance to once acknowledged.
    pub cursors: BTreeMap<ProviderId, CursorState>,
}

impl OrganizerBatch {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAck {
    /// Where the batch landed, e.g. `s3://bucket/key`.
    pub location: String,
}

#[derive(Debug, Error)]
pub enum OrganizerError {
    #[error("destination unavailable: {0}")]
    Unavailable(String),

    #[error("destination rejected batch: {0}")]
    Rejected(String),
}

impl Retryable for OrganizerError {
    fn is_retryable(&self) -> bool {
        matches!(self, OrganizerError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        OrganizerError::Unavailable(format!("no acknowledgement within {after:?}"))
    }
}

/// Destination for screened candidates. A returned ack means the batch is
/// durable there; only then do cursors advance.
#[async_trait]
pub trait Organizer: Send + Sync {
    async fn commit(&self, batch: &OrganizerBatch) -> Result<CommitAck, OrganizerError>;
}

/// Writes each batch as one JSON object under
/// `batches/{yyyy}/{mm}/{dd}/{run_id}.json`.
pub struct S3Organizer {
    s3: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Organizer {
    pub fn new(s3: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { s3, bucket }
    }
}

pub fn batch_key(run_id: Uuid, created_at: DateTime<Utc>) -> String {
    format!(
        "batches/{:04}/{:02}/{:02}/{run_id}.json",
        created_at.year(),
        created_at.month(),
        created_at.day()
    )
}

#[async_trait]
impl Organizer for S3Organizer {
    async fn commit(&self, batch: &OrganizerBatch) -> Result<CommitAck, OrganizerError> {
        let body = serde_json::to_vec_pretty(batch)
            .map_err(|e| OrganizerError::Rejected(format!("serializing batch: {e}")))?;
        let key = batch_key(batch.run_id, batch.created_at);

        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| OrganizerError::Unavailable(format!("S3 upload failed: {e}")))?;

        info!(
            "Uploaded batch of {} decisions and {} failures to s3://{}/{}",
            batch.decisions.len(),
            batch.failures.len(),
            self.bucket,
            key
        );
        Ok(CommitAck {
            location: format!("s3://{}/{key}", self.bucket),
        })
    }
}
