mod auth;
mod config;
mod db;
mod errors;
mod intake;
mod models;
mod normalize;
mod pipeline;
mod providers;
mod retry;
mod routes;
mod screening;
mod state;
mod store;

use anyhow::{Context, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::{GoogleServiceAccountGrant, MicrosoftRefreshGrant, TokenStore};
use crate::config::{Config, S3Config, StateBackend};
use crate::db::create_pool;
use crate::models::provider::ProviderId;
use crate::pipeline::organizer::S3Organizer;
use crate::pipeline::Pipeline;
use crate::providers::{DriveAdapter, DriveLinks, GraphGroupAdapter, ProviderAdapter};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::{FileStateStore, PgStateStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting intake v{}", env!("CARGO_PKG_VERSION"));

    let store = build_state_store(&config.state).await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.call_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let mut tokens = TokenStore::new(store.clone(), config.refresh_skew(), config.retry_policy());
    if let Some(ms) = &config.microsoft {
        let mut grant = MicrosoftRefreshGrant::new(http.clone(), &ms.tenant_id, ms.client_id.clone());
        if let Some(secret) = &ms.client_secret {
            grant = grant.with_client_secret(secret.clone());
        }
        tokens = tokens.with_exchanger(Arc::new(grant));
    }
    if let Some(google) = &config.google {
        tokens = tokens.with_exchanger(Arc::new(GoogleServiceAccountGrant::new(
            http.clone(),
            google.client_email.clone(),
            google.private_key_pem.clone(),
        )));
    }
    if let Some(seed) = config.microsoft.as_ref().and_then(|ms| ms.seed_refresh_token.clone()) {
        tokens.seed_refresh_token(ProviderId::Microsoft, seed).await?;
    }
    let tokens = Arc::new(tokens);

    let drive = config.google.as_ref().map(|google| {
        Arc::new(
            DriveAdapter::new(http.clone(), google.folder_id.clone()).with_retry(config.retry_policy()),
        )
    });
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();
    if let Some(ms) = &config.microsoft {
        let mut group = GraphGroupAdapter::new(http.clone(), ms.group_id.clone())
            .with_retry(config.retry_policy());
        if let Some(drive) = &drive {
            // Drive links in posts are downloaded with the Google credential.
            group = group.with_linked_files(Arc::new(DriveLinks::new(drive.clone(), tokens.clone())));
        }
        adapters.push(Arc::new(group));
        info!("Microsoft lane enabled for group {}", ms.group_id);
    }
    if let (Some(drive), Some(google)) = (drive, &config.google) {
        adapters.push(drive);
        info!("Google lane enabled for folder {}", google.folder_id);
    }

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config.s3).await;
    let organizer = Arc::new(S3Organizer::new(s3, config.s3.bucket.clone()));
    info!("S3 organizer initialized (bucket: {})", config.s3.bucket);

    info!(
        "Rule set: {} rules, threshold {}",
        config.rule_set.rules.len(),
        config.rule_set.threshold
    );
    let pipeline = Arc::new(Pipeline::new(
        store,
        tokens,
        adapters,
        organizer,
        Arc::new(config.rule_set.clone()),
        config.pipeline_options(),
    ));

    let shutdown = CancellationToken::new();
    let scheduler = config.run_interval_secs.map(|secs| {
        tokio::spawn(run_periodically(
            pipeline.clone(),
            Duration::from_secs(secs.max(1)),
            shutdown.clone(),
        ))
    });

    let state = AppState {
        pipeline,
        shutdown: shutdown.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!("Scheduler task ended abnormally: {e}");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn build_state_store(backend: &StateBackend) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match backend {
        StateBackend::Postgres { database_url } => {
            let pool = create_pool(database_url).await?;
            Arc::new(PgStateStore::new(pool))
        }
        StateBackend::Files { dir } => {
            info!("Using file state store at {dir}");
            Arc::new(FileStateStore::open(dir.as_str()).await?)
        }
    };
    Ok(store)
}

/// Starts a run every `interval` until shutdown. A tick that finds a run
/// already in flight is skipped.
async fn run_periodically(pipeline: Arc<Pipeline>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Periodic runs every {}s", interval.as_secs());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if pipeline.try_run(shutdown.child_token()).await.is_none() {
                    info!("Skipping scheduled run: previous run still in progress");
                }
            }
        }
    }
}

/// Resolves on Ctrl-C after cancelling in-flight runs.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, cancelling in-flight runs");
    shutdown.cancel();
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &S3Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.access_key_id,
        &config.secret_access_key,
        None,
        None,
        "intake-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
