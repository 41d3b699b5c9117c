use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{DatabaseError, ErrorKind, FactoryError};

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

/// HTTP status for each error class
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Config | ErrorKind::Validation | ErrorKind::Syntax => StatusCode::BAD_REQUEST,
        ErrorKind::Connection => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::UnsupportedOperation => StatusCode::CONFLICT,
        ErrorKind::Query => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_detail) = match self {
            AppError::Database(err) => {
                if err.kind == ErrorKind::Query {
                    tracing::error!("Query failed: {}", err);
                }
                let code = err.code.clone().unwrap_or_else(|| err.kind.as_str().to_uppercase());
                (
                    status_for(err.kind),
                    ErrorDetail::new(code, err.user_message()).with_details(err.details),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorDetail::new("BAD_REQUEST", msg)),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

impl From<FactoryError> for AppError {
    fn from(err: FactoryError) -> Self {
        AppError::Database(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::codes;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DatabaseError::config("bad port"), StatusCode::BAD_REQUEST),
            (DatabaseError::validation(vec!["DROP".into()]), StatusCode::BAD_REQUEST),
            (DatabaseError::syntax("near FROM"), StatusCode::BAD_REQUEST),
            (DatabaseError::connection("refused"), StatusCode::BAD_GATEWAY),
            (DatabaseError::timeout("slow"), StatusCode::GATEWAY_TIMEOUT),
            (DatabaseError::unsupported("closed"), StatusCode::CONFLICT),
            (DatabaseError::query("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_factory_errors_keep_every_message() {
        let err = AppError::from(FactoryError::InvalidConfig(vec!["host is required".into(), "port".into()]));
        match err {
            AppError::Database(db) => {
                assert_eq!(db.code.as_deref(), Some(codes::INVALID_CONFIG));
                assert_eq!(db.details.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_detail_creation() {
        let detail = ErrorDetail::new("TEST_CODE", "Test message");
        assert_eq!(detail.code, "TEST_CODE");
        assert_eq!(detail.message, "Test message");
        assert!(detail.details.is_empty());
    }
}
