//! Exercise library server - main entry point

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use exlib_common::logging::{init_logging, LogConfig};
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, sync::watch};
use tower_http::compression::CompressionLayer;
use tracing::{error, info, warn};

use exlib_server::{
    config::Config,
    features,
    ingest::{
        exercise::Normalizer, fetcher::HttpFetcher, ExerciseLibrary, JobKind, JobRegistry,
        JobRunner, JobStore, PgExerciseLibrary, PgJobStore, SourceFetcher, StaleJobSweeper,
        UpsertEngine,
    },
    middleware,
    storage::Storage,
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env_with(LogConfig {
        log_file_prefix: "exlib-server".to_string(),
        filter_directives: Some("exlib_server=debug,tower_http=debug,sqlx=warn".to_string()),
        ..LogConfig::default()
    })?;
    let _logging = init_logging(&log_config)?;

    info!("Starting exercise library server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    let storage = config.storage.clone().map(Storage::new);
    if let Some(storage) = &storage {
        info!(bucket = %storage.bucket(), "Storage client initialized");
    }

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));
    let library: Arc<dyn ExerciseLibrary> = Arc::new(PgExerciseLibrary::new(db_pool.clone()));

    let fetcher = SourceFetcher::new(
        storage,
        HttpFetcher::new(config.import.fetch_connect_timeout())?,
    );
    let runner = JobRunner::new(
        store.clone(),
        Arc::new(fetcher),
        UpsertEngine::new(library.clone()),
        config.import.source_reference()?,
        Normalizer::new(config.import.media_base_url.clone()),
        config.import.runner_config(),
    );
    let registry = Arc::new(
        JobRegistry::new(store.clone()).register(JobKind::UpdateExerciseLibrary, runner),
    );

    // Runs left behind by a previous process must not block new deploys
    let sweeper = StaleJobSweeper::new(
        store,
        config.import.liveness_timeout(),
        config.import.sweep_interval(),
    );
    match sweeper.sweep_once().await {
        Ok(swept) => info!(count = swept.len(), "Startup stale job sweep completed"),
        Err(e) => warn!(error = %e, "Startup stale job sweep failed"),
    }
    let (sweeper_stop, sweeper_rx) = watch::channel(false);
    let sweeper_handle = sweeper.spawn(sweeper_rx);

    let app = create_router(
        db_pool,
        features::FeatureState {
            registry: registry.clone(),
            library,
        },
        &config,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    info!(
        active = registry.active_runs(),
        "Waiting up to {} seconds for running jobs",
        timeout.as_secs()
    );
    registry.shutdown(timeout).await;

    if sweeper_stop.send(true).is_err() {
        warn!("Stale job sweeper already stopped");
    }
    if let Err(e) = sweeper_handle.await {
        error!(error = %e, "Stale job sweeper task failed");
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Create the application router with all routes and middleware
fn create_router(db: PgPool, state: features::FeatureState, config: &Config) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(db)
        .nest("/api/v1", features::router(state))
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(&config.cors))
}

async fn health_check(State(db): State<PgPool>) -> Result<Response, StatusCode> {
    match sqlx::query("SELECT 1").execute(&db).await {
        Ok(_) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response()),
        Err(e) => {
            error!("Database health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        },
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
