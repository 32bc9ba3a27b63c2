//! Rule evaluation: a pure function of (candidate, rule set).
//!
//! Score is the weighted share of satisfied scoring rules. Disqualifiers take
//! precedence: any match forces `Reject` whatever the score.

use crate::models::candidate::{CandidateRecord, StructuredFields};
use crate::models::decision::{Decision, Verdict};
use crate::normalize::terms::contains_term;
use crate::screening::rules::{Rule, RuleSet};

pub const NO_PARSEABLE_CONTENT: &str = "no parseable content";

enum Outcome {
    Met { weight: f64, reason: String },
    Unmet { weight: f64, reason: String },
    Disqualified { reason: String },
    Clear,
}

/// Evaluates one candidate. Performs no I/O and reads no clock.
pub fn evaluate(candidate: &CandidateRecord, rule_set: &RuleSet) -> Decision {
    let fields = &candidate.structured_fields;

    if fields.is_empty() {
        return Decision {
            candidate_record: candidate.clone(),
            verdict: Verdict::Reject,
            score: 0.0,
            reasons: vec![NO_PARSEABLE_CONTENT.to_string()],
        };
    }

    let text = fields.raw_text.to_lowercase();

    let mut total_weight = 0.0_f64;
    let mut satisfied_weight = 0.0_f64;
    let mut disqualified = false;
    let mut met = Vec::new();
    let mut against = Vec::new();

    for rule in &rule_set.rules {
        match rule_outcome(rule, fields, &text) {
            Outcome::Met { weight, reason } => {
                total_weight += weight;
                satisfied_weight += weight;
                met.push(reason);
            }
            Outcome::Unmet { weight, reason } => {
                total_weight += weight;
                against.push(reason);
            }
            Outcome::Disqualified { reason } => {
                disqualified = true;
                against.push(reason);
            }
            Outcome::Clear => {}
        }
    }

    let score = if total_weight > 0.0 {
        (satisfied_weight / total_weight).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let verdict = if !disqualified && score >= rule_set.threshold {
        Verdict::Accept
    } else {
        Verdict::Reject
    };

    let reasons = match verdict {
        Verdict::Accept => met,
        Verdict::Reject if against.is_empty() => vec![format!(
            "score {score:.2} below threshold {:.2}",
            rule_set.threshold
        )],
        Verdict::Reject => against,
    };

    Decision {
        candidate_record: candidate.clone(),
        verdict,
        score,
        reasons,
    }
}

fn rule_outcome(rule: &Rule, fields: &StructuredFields, text: &str) -> Outcome {
    match rule {
        Rule::RequiredSkill { skill, weight } => {
            let wanted = skill.trim().to_lowercase();
            let has = fields.skills.iter().any(|s| *s == wanted) || contains_term(text, &wanted);
            if has {
                Outcome::Met {
                    weight: *weight,
                    reason: format!("has skill: {wanted}"),
                }
            } else {
                Outcome::Unmet {
                    weight: *weight,
                    reason: format!("missing skill: {wanted}"),
                }
            }
        }
        Rule::MinExperience { years, weight } => match fields.experience_years {
            Some(found) if found >= *years => Outcome::Met {
                weight: *weight,
                reason: "experience meets minimum".to_string(),
            },
            Some(_) => Outcome::Unmet {
                weight: *weight,
                reason: "experience below minimum".to_string(),
            },
            None => Outcome::Unmet {
                weight: *weight,
                reason: "experience not stated".to_string(),
            },
        },
        Rule::Keyword { keyword, weight } => {
            let wanted = keyword.trim().to_lowercase();
            if contains_term(text, &wanted) {
                Outcome::Met {
                    weight: *weight,
                    reason: format!("mentions: {wanted}"),
                }
            } else {
                Outcome::Unmet {
                    weight: *weight,
                    reason: format!("does not mention: {wanted}"),
                }
            }
        }
        Rule::Location { any_of, weight } => {
            let Some(location) = fields.location.as_deref() else {
                return Outcome::Unmet {
                    weight: *weight,
                    reason: "location not stated".to_string(),
                };
            };
            let location = location.to_lowercase();
            match any_of.iter().find(|place| contains_term(&location, place)) {
                Some(place) => Outcome::Met {
                    weight: *weight,
                    reason: format!("location accepted: {}", place.trim().to_lowercase()),
                },
                None => Outcome::Unmet {
                    weight: *weight,
                    reason: format!("location not accepted: {location}"),
                },
            }
        }
        Rule::Disqualify { keywords } => {
            let hits: Vec<String> = keywords
                .iter()
                .filter(|k| contains_term(text, k))
                .map(|k| k.trim().to_lowercase())
                .collect();
            if hits.is_empty() {
                Outcome::Clear
            } else {
                Outcome::Disqualified {
                    reason: format!("disqualified: mentions {}", hits.join(", ")),
                }
            }
        }
    }
}
