use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::artifact::ArtifactRef;
use crate::models::provider::ProviderId;

/// An artifact already delivered inside the overlap window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenArtifact {
    pub artifact_id: String,
    /// SHA-256 of the fetched bytes (hex). `None` when the download failed.
    #[serde(default)]
    pub digest: Option<String>,
    pub provider_hash: Option<String>,
    pub source_timestamp: DateTime<Utc>,
}

/// Durable intake position for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub provider_id: ProviderId,
    /// `None` means beginning of time.
    pub last_seen_timestamp: Option<DateTime<Utc>>,
    pub last_seen_artifact_id: Option<String>,
    /// Entries newer than `last_seen_timestamp - overlap`, sorted by position.
    #[serde(default)]
    pub recent: Vec<SeenArtifact>,
}

impl CursorState {
    pub fn beginning(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            last_seen_timestamp: None,
            last_seen_artifact_id: None,
            recent: Vec::new(),
        }
    }

    /// Lower bound for re-listing: the last position minus the overlap margin.
    pub fn window_start(&self, overlap: Duration) -> Option<DateTime<Utc>> {
        self.last_seen_timestamp.map(|ts| ts - overlap)
    }

    /// Pre-fetch check against the overlap window, by id or provider checksum.
    pub fn has_seen(&self, artifact: &ArtifactRef) -> bool {
        self.recent.iter().any(|seen| {
            seen.artifact_id == artifact.artifact_id
                || matches!(
                    (&seen.provider_hash, &artifact.content_hash),
                    (Some(a), Some(b)) if a == b
                )
        })
    }

    /// Post-fetch check: the same bytes were already delivered.
    pub fn has_seen_digest(&self, digest: &str) -> bool {
        self.recent
            .iter()
            .any(|seen| seen.digest.as_deref() == Some(digest))
    }

    /// Returns the state after `processed` has been durably handed off.
    /// An empty batch yields an identical state.
    pub fn advanced_by(&self, processed: &[SeenArtifact], overlap: Duration) -> CursorState {
        if processed.is_empty() {
            return self.clone();
        }

        let mut last_ts = self.last_seen_timestamp;
        let mut last_id = self.last_seen_artifact_id.clone();
        for seen in processed {
            let candidate = (seen.source_timestamp, seen.artifact_id.as_str());
            let ahead = match (last_ts, last_id.as_deref()) {
                (Some(ts), Some(id)) => candidate > (ts, id),
                (Some(ts), None) => seen.source_timestamp >= ts,
                (None, _) => true,
            };
            if ahead {
                last_ts = Some(seen.source_timestamp);
                last_id = Some(seen.artifact_id.clone());
            }
        }

        let mut recent: Vec<SeenArtifact> = self.recent.clone();
        for seen in processed {
            let duplicate = recent
                .iter()
                .any(|r| r.artifact_id == seen.artifact_id && r.digest == seen.digest);
            if !duplicate {
                recent.push(seen.clone());
            }
        }
        if let Some(ts) = last_ts {
            let floor = ts - overlap;
            recent.retain(|r| r.source_timestamp >= floor);
        }
        recent.sort_by(|a, b| {
            (a.source_timestamp, &a.artifact_id, &a.digest).cmp(&(
                b.source_timestamp,
                &b.artifact_id,
                &b.digest,
            ))
        });

        CursorState {
            provider_id: self.provider_id,
            last_seen_timestamp: last_ts,
            last_seen_artifact_id: last_id,
            recent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, minute, 0).unwrap()
    }

    fn seen(id: &str, digest: &str, minute: u32) -> SeenArtifact {
        SeenArtifact {
            artifact_id: id.to_string(),
            digest: Some(digest.to_string()),
            provider_hash: None,
            source_timestamp: at(minute),
        }
    }

    fn artifact(id: &str, minute: u32, hash: Option<&str>) -> ArtifactRef {
        ArtifactRef {
            provider_id: ProviderId::Google,
            artifact_id: id.to_string(),
            source_timestamp: at(minute),
            content_hash: hash.map(String::from),
            name: None,
            mime_type: None,
            message_text: None,
        }
    }

    #[test]
    fn test_beginning_has_no_window() {
        let cursor = CursorState::beginning(ProviderId::Google);
        assert_eq!(cursor.window_start(Duration::minutes(5)), None);
    }

    #[test]
    fn test_empty_batch_leaves_state_identical() {
        let cursor = CursorState::beginning(ProviderId::Google)
            .advanced_by(&[seen("a", "d1", 1)], Duration::minutes(5));
        assert_eq!(cursor.advanced_by(&[], Duration::minutes(5)), cursor);
    }

    #[test]
    fn test_advance_moves_to_max_position() {
        let cursor = CursorState::beginning(ProviderId::Google).advanced_by(
            &[seen("b", "d2", 7), seen("a", "d1", 3), seen("c", "d3", 7)],
            Duration::minutes(5),
        );
        assert_eq!(cursor.last_seen_timestamp, Some(at(7)));
        assert_eq!(cursor.last_seen_artifact_id.as_deref(), Some("c"));
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let cursor = CursorState::beginning(ProviderId::Google)
            .advanced_by(&[seen("z", "d9", 20)], Duration::minutes(5))
            .advanced_by(&[seen("late", "d10", 18)], Duration::minutes(5));
        assert_eq!(cursor.last_seen_timestamp, Some(at(20)));
        assert_eq!(cursor.last_seen_artifact_id.as_deref(), Some("z"));
        assert!(cursor.recent.iter().any(|r| r.artifact_id == "late"));
    }

    #[test]
    fn test_recent_pruned_to_overlap_window() {
        let cursor = CursorState::beginning(ProviderId::Google).advanced_by(
            &[seen("old", "d1", 0), seen("mid", "d2", 16), seen("new", "d3", 20)],
            Duration::minutes(5),
        );
        let ids: Vec<_> = cursor.recent.iter().map(|r| r.artifact_id.as_str()).collect();
        assert_eq!(ids, vec!["mid", "new"]);
    }

    #[test]
    fn test_has_seen_by_id_or_provider_hash() {
        let mut entry = seen("a", "d1", 1);
        entry.provider_hash = Some("md5-a".to_string());
        let cursor =
            CursorState::beginning(ProviderId::Google).advanced_by(&[entry], Duration::minutes(5));

        assert!(cursor.has_seen(&artifact("a", 1, None)));
        assert!(cursor.has_seen(&artifact("renamed", 2, Some("md5-a"))));
        assert!(!cursor.has_seen(&artifact("b", 2, Some("md5-b"))));
        assert!(cursor.has_seen_digest("d1"));
        assert!(!cursor.has_seen_digest("d2"));
    }
}
