pub mod artifact;
pub mod candidate;
pub mod credential;
pub mod cursor;
pub mod decision;
pub mod provider;
