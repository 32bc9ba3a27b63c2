use serde::{Deserialize, Serialize};

use crate::models::candidate::CandidateRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject,
}

/// Filtering outcome for one candidate record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub candidate_record: CandidateRecord,
    pub verdict: Verdict,
    /// Normalized to [0, 1].
    pub score: f64,
    /// Rules that shaped the verdict, in rule-set order.
    pub reasons: Vec<String>,
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}
