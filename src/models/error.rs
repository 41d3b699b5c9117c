use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Boxed driver error handed to [`crate::services::database::DatabaseAdapter::map_error`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for everything behind the adapter boundary
pub type DbResult<T> = Result<T, DatabaseError>;

/// Normalized error codes shared by every dialect
pub mod codes {
    pub const CONNECTION_REFUSED: &str = "ECONNREFUSED";
    pub const CONNECTION_RESET: &str = "ECONNRESET";
    pub const TIMED_OUT: &str = "ETIMEDOUT";
    pub const HOST_UNREACHABLE: &str = "EHOSTUNREACH";
    pub const BROKEN_PIPE: &str = "EPIPE";
    pub const HOST_NOT_FOUND: &str = "ENOTFOUND";
    pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const UNKNOWN_DATABASE: &str = "UNKNOWN_DATABASE";
    pub const TLS_FAILED: &str = "TLS_FAILED";
    pub const POOL_TIMEOUT: &str = "POOL_TIMEOUT";
    pub const QUERY_TIMEOUT: &str = "QUERY_TIMEOUT";
    pub const SYNTAX_ERROR: &str = "SYNTAX_ERROR";
    pub const UNDEFINED_OBJECT: &str = "UNDEFINED_OBJECT";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    pub const ADAPTER_CLOSED: &str = "ADAPTER_CLOSED";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
    pub const UNSAFE_QUERY: &str = "UNSAFE_QUERY";
    pub const QUERY_FAILED: &str = "QUERY_FAILED";
}

/// Error categories every adapter classifies into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or incomplete connection configuration
    Config,
    /// Statement rejected by the safety validator
    Validation,
    /// Network or authentication failure
    Connection,
    /// Server- or client-enforced deadline exceeded
    Timeout,
    /// Engine rejected the statement
    Syntax,
    /// Wrong lifecycle state or capability missing in the dialect
    UnsupportedOperation,
    /// Any other execution failure
    Query,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::Syntax => "SYNTAX_ERROR",
            ErrorKind::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorKind::Query => "QUERY_ERROR",
        }
    }

    /// Kinds that can never succeed on a second attempt
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorKind::Config
                | ErrorKind::Validation
                | ErrorKind::Syntax
                | ErrorKind::UnsupportedOperation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized database error. No engine-native error type crosses the
/// adapter boundary; the original is kept only as an opaque `source`.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct DatabaseError {
    pub kind: ErrorKind,
    pub message: String,
    /// Normalized code from [`codes`]
    pub code: Option<String>,
    /// Engine-native code (SQLSTATE, MySQL errno, SQL Server error number, ...)
    pub native_code: Option<String>,
    /// Every violated rule or invalid field when more than one applies
    pub details: Vec<String>,
    #[source]
    pub source: Option<BoxError>,
}

impl DatabaseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            native_code: None,
            details: Vec::new(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message).with_code(codes::INVALID_CONFIG)
    }

    pub fn validation(errors: Vec<String>) -> Self {
        let message = if errors.is_empty() {
            "Query rejected by safety validation".to_string()
        } else {
            errors.join("; ")
        };
        let mut err = Self::new(ErrorKind::Validation, message).with_code(codes::UNSAFE_QUERY);
        err.details = errors;
        err
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message).with_code(codes::QUERY_TIMEOUT)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message).with_code(codes::SYNTAX_ERROR)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedOperation, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Query, message).with_code(codes::QUERY_FAILED)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_native_code(mut self, code: impl ToString) -> Self {
        self.native_code = Some(code.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_connection(&self) -> bool {
        self.kind == ErrorKind::Connection
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_syntax(&self) -> bool {
        self.kind == ErrorKind::Syntax
    }

    /// Human-readable cause derived from classification rather than the raw
    /// driver message.
    pub fn user_message(&self) -> String {
        let cause = match self.code.as_deref() {
            Some(codes::HOST_NOT_FOUND) => Some("host not found"),
            Some(codes::CONNECTION_REFUSED) => Some("connection refused (check host and port)"),
            Some(codes::HOST_UNREACHABLE) => Some("host unreachable"),
            Some(codes::CONNECTION_RESET) | Some(codes::BROKEN_PIPE) | Some(codes::CONNECTION_LOST) => {
                Some("connection dropped by the server")
            }
            Some(codes::AUTH_FAILED) => Some("authentication failed"),
            Some(codes::UNKNOWN_DATABASE) => Some("database does not exist"),
            Some(codes::TLS_FAILED) => Some("TLS handshake failed"),
            Some(codes::TIMED_OUT) => Some("connection timed out"),
            Some(codes::POOL_TIMEOUT) => Some("no pooled connection became available in time"),
            Some(codes::QUERY_TIMEOUT) => Some("query exceeded its time limit"),
            Some(codes::PERMISSION_DENIED) => Some("permission denied"),
            _ => None,
        };

        match (cause, self.kind) {
            (Some(cause), _) => format!("{}: {}", cause, self.message),
            (None, ErrorKind::Syntax) => format!("The database rejected the statement: {}", self.message),
            (None, _) => self.message.clone(),
        }
    }

    /// Classify an I/O error raised while talking to a server
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let (kind, code) = match err.kind() {
            Io::ConnectionRefused => (ErrorKind::Connection, codes::CONNECTION_REFUSED),
            Io::ConnectionReset | Io::ConnectionAborted => (ErrorKind::Connection, codes::CONNECTION_RESET),
            Io::BrokenPipe | Io::UnexpectedEof => (ErrorKind::Connection, codes::BROKEN_PIPE),
            Io::TimedOut => (ErrorKind::Timeout, codes::TIMED_OUT),
            Io::NotConnected | Io::AddrNotAvailable => (ErrorKind::Connection, codes::HOST_UNREACHABLE),
            _ => {
                return Self::classify_message(&err.to_string());
            }
        };
        Self::new(kind, err.to_string()).with_code(code)
    }

    /// Message-based fallback when a driver gives no structured code
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let (kind, code) = if lower.contains("failed to lookup address")
            || lower.contains("name or service not known")
            || lower.contains("no such host")
            || lower.contains("nodename nor servname")
        {
            (ErrorKind::Connection, codes::HOST_NOT_FOUND)
        } else if lower.contains("connection refused") {
            (ErrorKind::Connection, codes::CONNECTION_REFUSED)
        } else if lower.contains("connection reset") {
            (ErrorKind::Connection, codes::CONNECTION_RESET)
        } else if lower.contains("broken pipe") {
            (ErrorKind::Connection, codes::BROKEN_PIPE)
        } else if lower.contains("host unreachable") || lower.contains("network is unreachable") {
            (ErrorKind::Connection, codes::HOST_UNREACHABLE)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            (ErrorKind::Timeout, codes::TIMED_OUT)
        } else if lower.contains("password authentication failed")
            || lower.contains("access denied")
            || lower.contains("login failed")
        {
            (ErrorKind::Connection, codes::AUTH_FAILED)
        } else if lower.contains("syntax error") || lower.contains("syntax") {
            (ErrorKind::Syntax, codes::SYNTAX_ERROR)
        } else {
            (ErrorKind::Query, codes::QUERY_FAILED)
        };
        Self::new(kind, message.to_string()).with_code(code)
    }
}

/// Errors returned by the adapter factory
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Unsupported dialect: {0}. Supported dialects: postgresql, mysql, sqlite, sqlserver")]
    UnsupportedDialect(String),

    #[error("Invalid connection configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
}

impl FactoryError {
    pub fn errors(&self) -> Vec<String> {
        match self {
            FactoryError::UnsupportedDialect(_) => vec![self.to_string()],
            FactoryError::InvalidConfig(errors) => errors.clone(),
        }
    }
}

impl From<FactoryError> for DatabaseError {
    fn from(err: FactoryError) -> Self {
        let mut mapped = match &err {
            FactoryError::UnsupportedDialect(_) => DatabaseError::unsupported(err.to_string()),
            FactoryError::InvalidConfig(_) => DatabaseError::config(err.to_string()),
        };
        mapped.details = err.errors();
        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_classified() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = DatabaseError::from_io(&refused);
        assert!(err.is_connection());
        assert_eq!(err.code.as_deref(), Some(codes::CONNECTION_REFUSED));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(DatabaseError::from_io(&timed_out).is_timeout());
    }

    #[test]
    fn test_message_fallback() {
        let err = DatabaseError::classify_message("failed to lookup address information: Name or service not known");
        assert_eq!(err.code.as_deref(), Some(codes::HOST_NOT_FOUND));
        assert!(err.user_message().starts_with("host not found"));

        let err = DatabaseError::classify_message("password authentication failed for user \"app\"");
        assert_eq!(err.code.as_deref(), Some(codes::AUTH_FAILED));
        assert!(err.user_message().starts_with("authentication failed"));
    }

    #[test]
    fn test_validation_keeps_every_rule() {
        let err = DatabaseError::validation(vec!["first".into(), "second".into()]);
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.details.len(), 2);
        assert!(err.kind.is_permanent());
    }

    #[test]
    fn test_factory_error_conversion() {
        let err: DatabaseError = FactoryError::InvalidConfig(vec!["a".into(), "b".into()]).into();
        assert_eq!(err.kind, ErrorKind::Config);
        assert_eq!(err.details, vec!["a".to_string(), "b".to_string()]);

        let err: DatabaseError = FactoryError::UnsupportedDialect("oracle".into()).into();
        assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
    }
}
