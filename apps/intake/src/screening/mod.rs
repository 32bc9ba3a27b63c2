//! Filter/scoring engine: ordered weighted rules evaluated against candidate records.

pub mod engine;
pub mod rules;

pub use engine::evaluate;
pub use rules::{Rule, RuleSet};
