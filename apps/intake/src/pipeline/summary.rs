use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ErrorKind;
use crate::models::provider::ProviderId;

/// Stages of one run. `Failed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Authenticating,
    Listing,
    Normalizing,
    Scoring,
    Committing,
    Failed,
    Aborted,
}

impl RunStage {
    /// Legal forward transitions. Any non-terminal stage may fail or abort.
    pub fn can_advance_to(self, next: RunStage) -> bool {
        use RunStage::*;
        match (self, next) {
            (Failed | Aborted, _) => false,
            (_, Failed | Aborted) => self != Idle || next == Aborted,
            (Idle, Authenticating)
            | (Authenticating, Listing)
            | (Listing, Normalizing)
            | (Normalizing, Scoring)
            | (Scoring, Committing)
            | (Committing, Idle) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every lane committed.
    Completed,
    /// At least one lane failed; the others committed.
    Degraded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Degraded => "degraded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub listed: usize,
    pub normalized: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub normalization_failed: usize,
    /// Listed artifacts whose bytes were already delivered.
    pub duplicates_skipped: usize,
}

impl RunCounts {
    pub fn add(&mut self, other: &RunCounts) {
        self.listed += other.listed;
        self.normalized += other.normalized;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.normalization_failed += other.normalization_failed;
        self.duplicates_skipped += other.duplicates_skipped;
    }
}

/// The error that ended a lane or a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    pub kind: ErrorKind,
    pub stage: RunStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneSummary {
    pub provider_id: ProviderId,
    pub final_stage: RunStage,
    pub counts: RunCounts,
    pub fatal: Option<FatalError>,
    /// Whether this lane's cursor moved.
    pub cursor_advanced: bool,
}

/// User-visible report for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub lanes: Vec<LaneSummary>,
    pub fatal: Option<FatalError>,
}
