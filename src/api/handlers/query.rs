use axum::{extract::State, Json};
use serde::Deserialize;

use crate::api::handlers::connection::{AppState, ConnectionTarget};
use crate::api::middleware::AppError;
use crate::models::{Dialect, QueryOptions};
use crate::validation::ValidationReport;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(flatten)]
    pub target: ConnectionTarget,
    pub sql: String,
    #[serde(default)]
    pub max_rows: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl QueryRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sql.trim().is_empty() {
            return Err(AppError::BadRequest("SQL query cannot be empty".to_string()));
        }
        if self.max_rows == Some(0) {
            return Err(AppError::BadRequest("maxRows must be greater than zero".to_string()));
        }
        if self.timeout_secs == Some(0) {
            return Err(AppError::BadRequest("timeoutSecs must be greater than zero".to_string()));
        }
        Ok(())
    }

    fn options(&self) -> QueryOptions {
        QueryOptions {
            max_rows: self.max_rows,
            timeout_secs: self.timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub sql: String,
    pub dialect: String,
}

/// Validate, limit and run a read-only statement
pub async fn execute_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("Executing SQL query for {}", payload.target.describe());

    payload.validate()?;
    let options = payload.options();
    let config = payload.target.resolve()?;

    let execution = state.db.execute_query(config, payload.sql.trim(), &options).await?;

    Ok(Json(serde_json::json!({
        "query": execution,
    })))
}

/// Safety report without touching a database
pub async fn validate_query(
    State(state): State<AppState>,
    Json(payload): Json<ValidateRequest>,
) -> Result<Json<ValidationReport>, AppError> {
    let dialect: Dialect = payload
        .dialect
        .parse()
        .map_err(|d| AppError::BadRequest(format!("Unsupported dialect: {}", d)))?;

    Ok(Json(state.db.validate(&payload.sql, dialect)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> QueryRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_query_request_validation() {
        let valid = request(r#"{"connectionUrl": "sqlite:///tmp/a.db", "sql": "SELECT 1", "maxRows": 10}"#);
        assert!(valid.validate().is_ok());
        assert_eq!(valid.options().max_rows, Some(10));
        assert_eq!(valid.options().timeout_secs, None);

        let empty = request(r#"{"connectionUrl": "sqlite:///tmp/a.db", "sql": "   "}"#);
        assert!(empty.validate().is_err());

        let zero_rows = request(r#"{"connectionUrl": "sqlite:///tmp/a.db", "sql": "SELECT 1", "maxRows": 0}"#);
        assert!(zero_rows.validate().is_err());

        let zero_timeout = request(r#"{"connectionUrl": "sqlite:///tmp/a.db", "sql": "SELECT 1", "timeoutSecs": 0}"#);
        assert!(zero_timeout.validate().is_err());
    }
}
