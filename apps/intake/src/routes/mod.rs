pub mod health;
pub mod runs;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/runs", post(runs::handle_start_run))
        .route("/api/v1/runs/latest", get(runs::handle_latest_run))
        .route("/api/v1/cursors/:provider", get(runs::handle_get_cursor))
        .route(
            "/api/v1/credentials/:provider",
            delete(runs::handle_revoke_credential),
        )
        .with_state(state)
}
