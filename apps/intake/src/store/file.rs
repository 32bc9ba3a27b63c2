use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::models::credential::Credential;
use crate::models::cursor::CursorState;
use crate::models::provider::ProviderId;
use crate::pipeline::summary::RunSummary;
use crate::store::StateStore;

/// JSON-file state store for single-node deployments.
///
/// Layout under the root directory:
/// `credentials/{provider}.json`, `cursors/{provider}.json`,
/// `runs/{run_id}.json` and `runs/latest.json`.
/// Every write goes to a temp file in the same directory and is renamed into
/// place, so readers never observe a partial record.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["credentials", "cursors", "runs"] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .with_context(|| format!("Failed to create state directory {}", root.display()))?;
        }
        Ok(Self { root })
    }

    fn credential_path(&self, provider: ProviderId) -> PathBuf {
        self.root.join("credentials").join(format!("{provider}.json"))
    }

    fn cursor_path(&self, provider: ProviderId) -> PathBuf {
        self.root.join("cursors").join(format!("{provider}.json"))
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt state file {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn write_json_atomic<T: Serialize>(path: PathBuf, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path
            .parent()
            .context("State file path has no parent directory")?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!("Wrote state file {}", path.display());
        Ok(())
    })
    .await
    .context("State writer task panicked")?
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_credential(&self, provider: ProviderId) -> Result<Option<Credential>> {
        read_json(&self.credential_path(provider)).await
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        write_json_atomic(self.credential_path(credential.provider_id), credential).await
    }

    async fn delete_credential(&self, provider: ProviderId) -> Result<bool> {
        match tokio::fs::remove_file(self.credential_path(provider)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_cursor(&self, provider: ProviderId) -> Result<Option<CursorState>> {
        read_json(&self.cursor_path(provider)).await
    }

    async fn save_cursor(&self, cursor: &CursorState) -> Result<()> {
        write_json_atomic(self.cursor_path(cursor.provider_id), cursor).await
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<()> {
        let runs = self.runs_dir();
        write_json_atomic(runs.join(format!("{}.json", summary.run_id)), summary).await?;
        write_json_atomic(runs.join("latest.json"), summary).await
    }

    async fn latest_run(&self) -> Result<Option<RunSummary>> {
        read_json(&self.runs_dir().join("latest.json")).await
    }
}
