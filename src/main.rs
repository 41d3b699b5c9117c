use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use db_query_core::api::handlers::connection::AppState;
use db_query_core::api::routes::create_router;
use db_query_core::config::Config;
use db_query_core::services::database::DefaultAdapterFactory;
use db_query_core::services::{ConnectionPoolCache, DbService, QueryService, RetryPolicy};
use db_query_core::validation::QuerySafetyValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    let cache = Arc::new(ConnectionPoolCache::new(
        Arc::new(DefaultAdapterFactory::new()),
        config.pool_cache_config(),
        RetryPolicy::pool_bootstrap(),
    ));
    let queries = QueryService::new(
        QuerySafetyValidator::new(config.validator_config()),
        RetryPolicy::query_execution(),
    );
    let db = Arc::new(DbService::new(cache, queries));

    let state = AppState {
        db: db.clone(),
        config: config.clone(),
    };
    let app = create_router(state);

    // Start server
    let addr: SocketAddr = config
        .server_address()
        .parse()
        .with_context(|| format!("invalid server address {}", config.server_address()))?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!("Server error: {}", e);
    }

    let closed = db.shutdown().await;
    info!("Closed {} cached pool(s)", closed);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
