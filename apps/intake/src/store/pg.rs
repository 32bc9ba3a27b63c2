use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::models::credential::Credential;
use crate::models::cursor::{CursorState, SeenArtifact};
use crate::models::provider::ProviderId;
use crate::pipeline::summary::RunSummary;
use crate::store::StateStore;

/// Postgres-backed state store. Tables come from `migrations/`.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct CredentialRow {
    provider_id: String,
    access_token: String,
    refresh_token: Option<String>,
    expiry_timestamp: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = anyhow::Error;

    fn try_from(row: CredentialRow) -> Result<Self> {
        Ok(Credential {
            provider_id: row.provider_id.parse().map_err(|e: String| anyhow!(e))?,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            expiry_timestamp: row.expiry_timestamp,
        })
    }
}

#[derive(Debug, FromRow)]
struct CursorRow {
    provider_id: String,
    last_seen_timestamp: Option<DateTime<Utc>>,
    last_seen_artifact_id: Option<String>,
    recent: Json<Vec<SeenArtifact>>,
}

impl TryFrom<CursorRow> for CursorState {
    type Error = anyhow::Error;

    fn try_from(row: CursorRow) -> Result<Self> {
        Ok(CursorState {
            provider_id: row.provider_id.parse().map_err(|e: String| anyhow!(e))?,
            last_seen_timestamp: row.last_seen_timestamp,
            last_seen_artifact_id: row.last_seen_artifact_id,
            recent: row.recent.0,
        })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load_credential(&self, provider: ProviderId) -> Result<Option<Credential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT provider_id, access_token, refresh_token, expiry_timestamp
            FROM provider_credentials
            WHERE provider_id = $1
            "#,
        )
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Credential::try_from).transpose()
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_credentials
                (provider_id, access_token, refresh_token, expiry_timestamp, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (provider_id) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expiry_timestamp = EXCLUDED.expiry_timestamp,
                updated_at = now()
            "#,
        )
        .bind(credential.provider_id.as_str())
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expiry_timestamp)
        .execute(&self.pool)
        .await?;
        debug!("Saved credential for {}", credential.provider_id);
        Ok(())
    }

    async fn delete_credential(&self, provider: ProviderId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM provider_credentials WHERE provider_id = $1")
            .bind(provider.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_cursor(&self, provider: ProviderId) -> Result<Option<CursorState>> {
        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT provider_id, last_seen_timestamp, last_seen_artifact_id, recent
            FROM intake_cursors
            WHERE provider_id = $1
            "#,
        )
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(CursorState::try_from).transpose()
    }

    async fn save_cursor(&self, cursor: &CursorState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO intake_cursors
                (provider_id, last_seen_timestamp, last_seen_artifact_id, recent, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (provider_id) DO UPDATE SET
                last_seen_timestamp = EXCLUDED.last_seen_timestamp,
                last_seen_artifact_id = EXCLUDED.last_seen_artifact_id,
                recent = EXCLUDED.recent,
                updated_at = now()
            "#,
        )
        .bind(cursor.provider_id.as_str())
        .bind(cursor.last_seen_timestamp)
        .bind(&cursor.last_seen_artifact_id)
        .bind(Json(&cursor.recent))
        .execute(&self.pool)
        .await?;
        debug!("Saved cursor for {}", cursor.provider_id);
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO intake_runs (run_id, started_at, finished_at, status, summary)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id) DO UPDATE SET
                finished_at = EXCLUDED.finished_at,
                status = EXCLUDED.status,
                summary = EXCLUDED.summary
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.status.as_str())
        .bind(Json(summary))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<RunSummary>> {
        let summary: Option<Json<RunSummary>> = sqlx::query_scalar(
            "SELECT summary FROM intake_runs ORDER BY finished_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(summary.map(|s| s.0))
    }
}
