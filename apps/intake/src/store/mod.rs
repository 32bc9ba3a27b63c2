//! Durable key-value state: `{provider -> Credential}`, `{provider -> CursorState}`
//! and the run log. Two backends share one trait so the pipeline never cares
//! where state lives.

pub mod file;
pub mod pg;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::credential::Credential;
use crate::models::cursor::CursorState;
use crate::models::provider::ProviderId;
use crate::pipeline::summary::RunSummary;

pub use file::FileStateStore;
pub use pg::PgStateStore;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_credential(&self, provider: ProviderId) -> Result<Option<Credential>>;

    /// Replaces the provider's credential. Must be durable before returning.
    async fn save_credential(&self, credential: &Credential) -> Result<()>;

    /// Returns `true` when a credential existed.
    async fn delete_credential(&self, provider: ProviderId) -> Result<bool>;

    async fn load_cursor(&self, provider: ProviderId) -> Result<Option<CursorState>>;

    /// Replaces the provider's cursor. Must be durable before returning.
    async fn save_cursor(&self, cursor: &CursorState) -> Result<()>;

    async fn record_run(&self, summary: &RunSummary) -> Result<()>;

    async fn latest_run(&self) -> Result<Option<RunSummary>>;
}
