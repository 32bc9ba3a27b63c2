use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::models::provider::ProviderId;

/// Stable, serializable classification of pipeline errors for run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthExpired,
    ProviderUnavailable,
    ProviderAuth,
    ProviderProtocol,
    OrganizerCommit,
    Store,
    Cancelled,
}

/// Error taxonomy of the intake pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The refresh grant itself is invalid or revoked. Needs interactive re-consent.
    #[error("authentication expired for {provider}: {message}")]
    AuthExpired {
        provider: ProviderId,
        message: String,
    },

    /// Transport failure, timeout, throttling or 5xx after bounded retries.
    #[error("{provider} unavailable: {message}")]
    ProviderUnavailable {
        provider: ProviderId,
        message: String,
    },

    /// The provider rejected a credential the token store believed valid.
    #[error("{provider} rejected credentials: {message}")]
    ProviderAuth {
        provider: ProviderId,
        message: String,
    },

    #[error("{provider} returned an unexpected response: {message}")]
    ProviderProtocol {
        provider: ProviderId,
        message: String,
    },

    #[error("organizer commit failed: {0}")]
    OrganizerCommit(String),

    #[error("state store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::AuthExpired { .. } => ErrorKind::AuthExpired,
            PipelineError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            PipelineError::ProviderAuth { .. } => ErrorKind::ProviderAuth,
            PipelineError::ProviderProtocol { .. } => ErrorKind::ProviderProtocol,
            PipelineError::OrganizerCommit(_) => ErrorKind::OrganizerCommit,
            PipelineError::Store(_) => ErrorKind::Store,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Pipeline(e) => {
                tracing::error!("Pipeline error: {e}");
                let status = match e.kind() {
                    ErrorKind::AuthExpired => StatusCode::UNAUTHORIZED,
                    ErrorKind::ProviderUnavailable | ErrorKind::OrganizerCommit => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, "PIPELINE_ERROR", e.to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
