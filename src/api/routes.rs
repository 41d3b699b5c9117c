use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::connection::AppState;
use crate::api::handlers::{connection, metadata, query};

/// Create router with application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/connections/test", post(connection::test_connection))
        .route("/api/connections/invalidate", post(connection::invalidate_connection))
        .route("/api/schema", post(metadata::get_schema))
        .route("/api/query", post(query::execute_query))
        .route("/api/query/validate", post(query::validate_query))
        .route("/api/cache/stats", get(connection::cache_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
