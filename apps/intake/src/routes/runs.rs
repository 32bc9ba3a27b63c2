use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::errors::AppError;
use crate::models::cursor::CursorState;
use crate::models::provider::ProviderId;
use crate::pipeline::summary::RunSummary;
use crate::state::AppState;

#[derive(Serialize)]
pub struct RevokeResponse {
    pub provider_id: ProviderId,
    pub revoked: bool,
}

fn parse_provider(raw: &str) -> Result<ProviderId, AppError> {
    raw.parse().map_err(AppError::Validation)
}

/// POST /api/v1/runs
pub async fn handle_start_run(
    State(state): State<AppState>,
) -> Result<Json<RunSummary>, AppError> {
    let summary = state
        .pipeline
        .try_run(state.shutdown.child_token())
        .await
        .ok_or_else(|| AppError::Conflict("a run is already in progress".to_string()))?;
    Ok(Json(summary))
}

/// GET /api/v1/runs/latest
pub async fn handle_latest_run(
    State(state): State<AppState>,
) -> Result<Json<RunSummary>, AppError> {
    let latest = state.pipeline.store().latest_run().await?;
    latest
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no run has been recorded yet".to_string()))
}

/// GET /api/v1/cursors/:provider
pub async fn handle_get_cursor(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<CursorState>, AppError> {
    let provider = parse_provider(&provider)?;
    let cursor = state.pipeline.cursors().current(provider).await?;
    Ok(Json(cursor))
}

/// DELETE /api/v1/credentials/:provider
pub async fn handle_revoke_credential(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<(StatusCode, Json<RevokeResponse>), AppError> {
    let provider = parse_provider(&provider)?;
    let revoked = state.pipeline.tokens().revoke(provider).await?;
    let status = if revoked {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((
        status,
        Json(RevokeResponse {
            provider_id: provider,
            revoked,
        }),
    ))
}
