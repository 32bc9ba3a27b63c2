use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Cancelled on shutdown; runs started over HTTP observe it too.
    pub shutdown: CancellationToken,
}
