//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{PgJobQueue, PgStore, RedisLockCache},
    config::Config,
    error::ApiError,
    web::{self, rest::ApiDoc, state::AppState},
    worker::WorkerPool,
};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderValue, Method,
};
use axum::Router;
use coupon_book_core::generation::{CodeGenerator, GeneratorSettings};
use coupon_book_core::ports::{Clock, SystemClock};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(env = %config.app_env, "Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PgStore::new(db_pool.clone()));
    info!("Running database migrations...");
    store.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Lock Cache & Job Queue ---
    info!("Connecting to Redis...");
    let cache = Arc::new(RedisLockCache::connect(&config.redis_url).await?);
    let queue = Arc::new(PgJobQueue::new(db_pool).with_stall_timeout(config.job_stall_timeout));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // --- 4. Build the Shared AppState & Start Workers ---
    let app_state = Arc::new(
        AppState::new(
            store.clone(),
            cache,
            queue.clone(),
            clock.clone(),
            config.lock_ttl,
        )
        .with_hidden_error_details(config.is_production()),
    );

    let shutdown = CancellationToken::new();
    let generator = CodeGenerator::new(
        store,
        clock,
        GeneratorSettings {
            max_batch_size: config.generation_max_batch,
            ..GeneratorSettings::default()
        },
    );
    let workers = WorkerPool::spawn(
        config.generation_concurrency,
        queue,
        generator,
        config.job_poll_interval,
        shutdown.clone(),
    );

    // --- 5. Create the Web Router ---
    let origin = config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::Internal(format!("Invalid CORS origin '{}': {}", config.cors_origin, e)))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    let app = Router::new()
        .merge(web::router(app_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // --- 7. Drain Workers ---
    shutdown.cancel();
    workers.join().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
}
