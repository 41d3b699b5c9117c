use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::{mask_credentials, ConnectionConfig, TestConnectionResult};
use crate::services::{CacheStats, DbService};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbService>,
    pub config: Config,
}

/// Identifies a database either by URL or by a full configuration object
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTarget {
    #[serde(default)]
    pub connection_url: Option<String>,
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

impl ConnectionTarget {
    pub fn resolve(self) -> Result<ConnectionConfig, AppError> {
        match (self.connection, self.connection_url) {
            (Some(config), None) => Ok(config),
            (None, Some(url)) if !url.trim().is_empty() => Ok(ConnectionConfig::from_url(url.trim())?),
            (Some(_), Some(_)) => Err(AppError::BadRequest(
                "Provide either connection or connectionUrl, not both".to_string(),
            )),
            _ => Err(AppError::BadRequest(
                "A connection or connectionUrl is required".to_string(),
            )),
        }
    }

    /// Loggable description with credentials masked
    pub fn describe(&self) -> String {
        match (&self.connection, &self.connection_url) {
            (Some(config), _) => format!("{} {}", config.dialect, config.database),
            (None, Some(url)) => mask_credentials(url),
            (None, None) => "<none>".to_string(),
        }
    }
}

/// Throwaway connection test; failures are reported in the body
pub async fn test_connection(
    State(state): State<AppState>,
    Json(payload): Json<ConnectionTarget>,
) -> Result<Json<TestConnectionResult>, AppError> {
    tracing::info!("Testing connection: {}", payload.describe());
    let config = payload.resolve()?;
    Ok(Json(state.db.test_connection(config).await))
}

/// Close the cached pool for a connection, if any
pub async fn invalidate_connection(
    State(state): State<AppState>,
    Json(payload): Json<ConnectionTarget>,
) -> Result<Json<serde_json::Value>, AppError> {
    let config = payload.resolve()?;
    let invalidated = state.db.invalidate(&config).await;

    Ok(Json(serde_json::json!({
        "invalidated": invalidated,
    })))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats: CacheStats = state.db.cache_stats().await;

    Json(serde_json::json!({
        "stats": stats,
        "hitRatio": stats.hit_ratio(),
        "maxSize": state.config.pool_cache.max_size,
    }))
}
