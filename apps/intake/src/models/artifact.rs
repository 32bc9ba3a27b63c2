use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::provider::ProviderId;

/// One resume file as observed in a provider listing. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub provider_id: ProviderId,
    pub artifact_id: String,
    pub source_timestamp: DateTime<Utc>,
    /// Provider-reported checksum, when the provider offers one (Drive md5).
    pub content_hash: Option<String>,
    /// File name as reported by the provider. Informational only.
    pub name: Option<String>,
    /// MIME type as reported by the provider. Never trusted for type detection.
    pub mime_type: Option<String>,
    /// Plain text of the message that carried the file. Used as the resume
    /// text when the file itself yields none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_text: Option<String>,
}

impl ArtifactRef {
    /// Total order used for cursor positions and batch sorting.
    pub fn position(&self) -> (DateTime<Utc>, &str) {
        (self.source_timestamp, self.artifact_id.as_str())
    }
}
