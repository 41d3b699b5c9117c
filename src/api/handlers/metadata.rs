use axum::{extract::State, Json};
use serde::Deserialize;

use crate::api::handlers::connection::{AppState, ConnectionTarget};
use crate::api::middleware::AppError;
use crate::models::SchemaOptions;

#[derive(Debug, Deserialize)]
pub struct SchemaRequest {
    #[serde(flatten)]
    pub target: ConnectionTarget,
    #[serde(default)]
    pub options: SchemaOptions,
}

/// Introspect tables, columns and relationships
pub async fn get_schema(
    State(state): State<AppState>,
    Json(payload): Json<SchemaRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("Fetching schema for {}", payload.target.describe());

    let config = payload.target.resolve()?;
    let schema = state.db.get_schema(config, &payload.options).await?;
    let content_hash = schema.content_hash();

    Ok(Json(serde_json::json!({
        "schema": schema,
        "contentHash": content_hash,
    })))
}
