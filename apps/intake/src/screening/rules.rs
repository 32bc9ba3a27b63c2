use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single screening rule. Scoring rules carry a weight; disqualifiers force
/// rejection when they match and never contribute to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    RequiredSkill { skill: String, weight: f64 },
    MinExperience { years: f64, weight: f64 },
    Keyword { keyword: String, weight: f64 },
    /// Parsed location must contain one of the listed places.
    Location { any_of: Vec<String>, weight: f64 },
    Disqualify { keywords: Vec<String> },
}

impl Rule {
    /// Weight for scoring rules, `None` for disqualifiers.
    pub fn weight(&self) -> Option<f64> {
        match self {
            Rule::RequiredSkill { weight, .. }
            | Rule::MinExperience { weight, .. }
            | Rule::Keyword { weight, .. }
            | Rule::Location { weight, .. } => Some(*weight),
            Rule::Disqualify { .. } => None,
        }
    }
}

/// Ordered rules plus the acceptance threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub threshold: f64,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RuleSetError {
    #[error("threshold {0} must be within [0, 1]")]
    Threshold(f64),

    #[error("rule {index}: weight {weight} must be finite and non-negative")]
    Weight { index: usize, weight: f64 },

    #[error("rule {index}: {message}")]
    Invalid { index: usize, message: String },
}

impl RuleSet {
    pub fn new(threshold: f64, rules: Vec<Rule>) -> Result<Self, RuleSetError> {
        let rule_set = Self { threshold, rules };
        rule_set.validate()?;
        Ok(rule_set)
    }

    pub fn validate(&self) -> Result<(), RuleSetError> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(RuleSetError::Threshold(self.threshold));
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(weight) = rule.weight() {
                if !weight.is_finite() || weight < 0.0 {
                    return Err(RuleSetError::Weight { index, weight });
                }
            }
            let invalid = |message: &str| RuleSetError::Invalid {
                index,
                message: message.to_string(),
            };
            match rule {
                Rule::RequiredSkill { skill, .. } if skill.trim().is_empty() => {
                    return Err(invalid("skill must not be empty"))
                }
                Rule::Keyword { keyword, .. } if keyword.trim().is_empty() => {
                    return Err(invalid("keyword must not be empty"))
                }
                Rule::MinExperience { years, .. } if !years.is_finite() || *years < 0.0 => {
                    return Err(invalid("years must be finite and non-negative"))
                }
                Rule::Location { any_of, .. }
                    if any_of.is_empty() || any_of.iter().any(|l| l.trim().is_empty()) =>
                {
                    return Err(invalid("location list must hold non-empty places"))
                }
                Rule::Disqualify { keywords }
                    if keywords.is_empty() || keywords.iter().any(|k| k.trim().is_empty()) =>
                {
                    return Err(invalid("disqualifier needs non-empty keywords"))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parses the rules file format: either a bare array of rules or an object
    /// `{"threshold": .., "rules": [..]}`. A bare array takes `default_threshold`.
    pub fn from_json(json: &str, default_threshold: f64) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RulesFile {
            Full(RuleSet),
            Bare(Vec<Rule>),
        }

        let rule_set = match serde_json::from_str::<RulesFile>(json)? {
            RulesFile::Full(rule_set) => rule_set,
            RulesFile::Bare(rules) => RuleSet {
                threshold: default_threshold,
                rules,
            },
        };
        rule_set.validate()?;
        Ok(rule_set)
    }
}

impl Default for RuleSet {
    /// Screening defaults for the hardware hiring inbox this service grew out of.
    fn default() -> Self {
        Self {
            threshold: 0.5,
            rules: vec![
                Rule::RequiredSkill {
                    skill: "verilog".to_string(),
                    weight: 0.3,
                },
                Rule::RequiredSkill {
                    skill: "systemverilog".to_string(),
                    weight: 0.2,
                },
                Rule::MinExperience {
                    years: 3.0,
                    weight: 0.3,
                },
                Rule::Location {
                    any_of: vec![
                        "oregon".to_string(),
                        "portland".to_string(),
                        "mexico".to_string(),
                        "or".to_string(),
                    ],
                    weight: 0.2,
                },
            ],
        }
    }
}
