// Database adapter trait: one engine's protocol and catalog behind a fixed
// operation set
use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use sqlparser::ast::Statement;
use sqlparser::dialect::Dialect as SqlDialect;
use sqlparser::parser::{Parser, ParserError};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::{
    codes, BoxError, ConnectionSettings, DatabaseError, DbResult, Dialect, QueryOptions,
    QueryResult, SchemaInfo, SchemaOptions, ServerInfo, TestConnectionResult,
};
use crate::services::retry::{RetryPolicy, RetryService};
use crate::validation::sql_text::{self, LexicalRules};

/// Used by [`DatabaseAdapter::execute_query`] when the caller gives none
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Adapter lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Unconnected,
    Connected,
    Closed,
}

enum SlotState<P> {
    Unconnected,
    Connected(P),
    Closed,
}

/// Holds an adapter's private pool handle and enforces the lifecycle.
///
/// `P` is a cheaply clonable pool handle; it never leaves the adapter
/// that owns the slot.
pub struct PoolSlot<P> {
    state: RwLock<SlotState<P>>,
}

impl<P> Default for PoolSlot<P> {
    fn default() -> Self {
        Self {
            state: RwLock::new(SlotState::Unconnected),
        }
    }
}

impl<P: Clone + Send + Sync> PoolSlot<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> AdapterState {
        match &*self.state.read().await {
            SlotState::Unconnected => AdapterState::Unconnected,
            SlotState::Connected(_) => AdapterState::Connected,
            SlotState::Closed => AdapterState::Closed,
        }
    }

    /// Current pool, or the error for calling in the wrong state
    pub async fn pool(&self) -> DbResult<P> {
        match &*self.state.read().await {
            SlotState::Connected(pool) => Ok(pool.clone()),
            SlotState::Unconnected => Err(DatabaseError::config(
                "Adapter is not connected; call create_pool first",
            )
            .with_code(codes::NOT_CONNECTED)),
            SlotState::Closed => Err(closed_error()),
        }
    }

    /// Open the pool once. The write lock is held across `open`, so
    /// concurrent callers share a single pool.
    pub async fn open<F, Fut>(&self, open: F) -> DbResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<P>>,
    {
        let mut state = self.state.write().await;
        match &*state {
            SlotState::Connected(_) => Ok(()),
            SlotState::Closed => Err(closed_error()),
            SlotState::Unconnected => {
                let pool = open().await?;
                *state = SlotState::Connected(pool);
                Ok(())
            }
        }
    }

    /// Move to `Closed`, returning the pool if one was open. Idempotent.
    pub async fn close(&self) -> Option<P> {
        let mut state = self.state.write().await;
        match std::mem::replace(&mut *state, SlotState::Closed) {
            SlotState::Connected(pool) => Some(pool),
            _ => None,
        }
    }
}

fn closed_error() -> DatabaseError {
    DatabaseError::unsupported("Adapter has been closed").with_code(codes::ADAPTER_CLOSED)
}

/// Error for an application-side deadline
pub(crate) fn query_timeout_error(timeout_secs: u64) -> DatabaseError {
    DatabaseError::timeout(format!("Query exceeded the {}s timeout", timeout_secs))
}

/// What sqlparser made of a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseCheck {
    /// Exactly one query statement
    Query,
    /// The grammar stopped on a construct it does not cover
    Unsupported(String),
}

/// Parse with the engine's grammar. Empty input, anything but a single
/// query, unterminated tokens and truncated statements are syntax errors.
/// Other parser failures are reported as `Unsupported` for the caller to
/// settle.
pub(crate) fn check_single_query(dialect: &dyn SqlDialect, sql: &str) -> DbResult<ParseCheck> {
    let statements = match Parser::parse_sql(dialect, sql) {
        Ok(statements) => statements,
        Err(e @ ParserError::TokenizerError(_)) => {
            return Err(DatabaseError::syntax(format!("SQL parsing error: {}", e)))
        }
        Err(e) if e.to_string().contains("found: EOF") => {
            return Err(DatabaseError::syntax(format!("SQL parsing error: {}", e)))
        }
        Err(e) => return Ok(ParseCheck::Unsupported(e.to_string())),
    };

    match statements.as_slice() {
        [] => Err(DatabaseError::syntax("Empty SQL query")),
        [Statement::Query(_)] => Ok(ParseCheck::Query),
        [_] => Err(DatabaseError::syntax("Only SELECT queries are permitted")),
        _ => Err(DatabaseError::syntax("Multiple statements are not allowed")),
    }
}

/// Single-query check for server engines. When sqlparser cannot follow a
/// statement that still reads as one `SELECT`/`WITH`, the server decides.
pub(crate) fn parse_single_query(dialect: &dyn SqlDialect, rules: LexicalRules, sql: &str) -> DbResult<()> {
    match check_single_query(dialect, sql)? {
        ParseCheck::Query => Ok(()),
        ParseCheck::Unsupported(reason) if sql_text::is_single_read(sql, rules) => {
            debug!("Deferring to the server on a statement sqlparser cannot follow: {}", reason);
            Ok(())
        }
        ParseCheck::Unsupported(reason) => Err(DatabaseError::syntax(format!("SQL parsing error: {}", reason))),
    }
}

/// Database adapter trait - abstraction layer over the supported engines.
///
/// Implementations own a private pool handle; nothing driver-specific
/// crosses this boundary. Pool-backed operations fail with a `Config`
/// error while `Unconnected` and `UnsupportedOperation` once `Closed`.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn settings(&self) -> &ConnectionSettings;

    async fn state(&self) -> AdapterState;

    async fn is_connected(&self) -> bool {
        self.state().await == AdapterState::Connected
    }

    /// `Unconnected -> Connected`; a no-op when already connected
    async fn create_pool(&self) -> DbResult<()>;

    /// `-> Closed`, draining the pool if one is open; a no-op when closed
    async fn close_pool(&self) -> DbResult<()>;

    /// One throwaway connection and a trivial round trip. Never touches
    /// the shared pool.
    async fn probe(&self) -> DbResult<ServerInfo>;

    /// [`probe`](Self::probe) under a retry policy. Never fails: errors come
    /// back as `success = false`.
    async fn test_connection(&self, policy: &RetryPolicy) -> TestConnectionResult {
        let retry = RetryService::new(policy.clone());
        let outcome = retry
            .run("test_connection", || async {
                let started = Instant::now();
                self.probe().await.map(|info| (info, started.elapsed()))
            })
            .await;

        match outcome.result {
            Ok((info, latency)) => {
                info!(
                    dialect = %self.dialect(),
                    database = %info.database,
                    latency_ms = latency.as_millis() as u64,
                    attempts = outcome.attempts,
                    "Connection test succeeded"
                );
                TestConnectionResult::succeeded(info, latency.as_millis() as u64, outcome.attempts)
            }
            Err(err) => {
                warn!(
                    dialect = %self.dialect(),
                    attempts = outcome.attempts,
                    error = %err,
                    "Connection test failed"
                );
                TestConnectionResult::failed(&err, outcome.attempts)
            }
        }
    }

    /// Catalog introspection keyed by qualified table name. Read-only.
    async fn get_schema(&self, options: &SchemaOptions) -> DbResult<SchemaInfo>;

    /// Apply the optional row cap, then run with the requested or default
    /// timeout
    async fn execute_query(&self, sql: &str, options: &QueryOptions) -> DbResult<QueryResult> {
        let sql = match options.max_rows {
            Some(max_rows) => self.enforce_row_limit(sql, max_rows),
            None => self.sanitize_query(sql),
        };
        let timeout_secs = options.timeout_secs.unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);
        self.execute_with_timeout(&sql, timeout_secs).await
    }

    /// Run on a pooled connection under both the server-side timeout (when
    /// the engine has one) and a wall-clock cutoff. On timeout the
    /// connection is returned or discarded, never abandoned.
    async fn execute_with_timeout(&self, sql: &str, timeout_secs: u64) -> DbResult<QueryResult>;

    /// At most `max_rows` rows using the native pagination clause. A
    /// stricter existing limit is kept. Idempotent.
    fn enforce_row_limit(&self, sql: &str, max_rows: u64) -> String;

    /// Session-scoped statement enforcing a server-side deadline; `None`
    /// when the engine has no such mechanism
    fn timeout_sql(&self, timeout_secs: u64) -> Option<String>;

    fn quote_identifier(&self, identifier: &str) -> String;

    /// Syntax check with the engine's grammar. Independent of the safety
    /// validator.
    fn validate_query(&self, sql: &str) -> DbResult<()>;

    /// Strip comments and trailing terminators
    fn sanitize_query(&self, sql: &str) -> String;

    /// Normalize a native driver error
    fn map_error(&self, err: BoxError) -> DatabaseError;

    fn is_connection_error(&self, err: &DatabaseError) -> bool {
        err.is_connection()
    }

    fn is_timeout_error(&self, err: &DatabaseError) -> bool {
        err.is_timeout()
    }

    fn is_syntax_error(&self, err: &DatabaseError) -> bool {
        err.is_syntax()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;
    use sqlparser::dialect::{MsSqlDialect, PostgreSqlDialect};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pool_slot_lifecycle() {
        let slot: PoolSlot<u32> = PoolSlot::new();
        assert_eq!(slot.state().await, AdapterState::Unconnected);

        let err = slot.pool().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert_eq!(err.code.as_deref(), Some(codes::NOT_CONNECTED));

        slot.open(|| async { Ok(7) }).await.unwrap();
        assert_eq!(slot.pool().await.unwrap(), 7);

        // Second open is a no-op
        slot.open(|| async { Ok(8) }).await.unwrap();
        assert_eq!(slot.pool().await.unwrap(), 7);

        assert_eq!(slot.close().await, Some(7));
        assert_eq!(slot.close().await, None);
        assert_eq!(slot.state().await, AdapterState::Closed);

        let err = slot.pool().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
        let err = slot.open(|| async { Ok(9) }).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_pool_slot_failed_open_stays_unconnected() {
        let slot: PoolSlot<u32> = PoolSlot::new();
        let err = slot
            .open(|| async { Err(DatabaseError::connection("refused")) })
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert_eq!(slot.state().await, AdapterState::Unconnected);
    }

    #[tokio::test]
    async fn test_concurrent_open_runs_once() {
        let slot: Arc<PoolSlot<u32>> = Arc::new(PoolSlot::new());
        let opened = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                let opened = opened.clone();
                tokio::spawn(async move {
                    slot.open(|| async move {
                        tokio::task::yield_now().await;
                        Ok(opened.fetch_add(1, Ordering::SeqCst))
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_single_query() {
        let pg = LexicalRules::for_dialect(Dialect::PostgreSql);
        assert!(parse_single_query(&PostgreSqlDialect {}, pg, "SELECT * FROM users").is_ok());
        assert!(parse_single_query(
            &MsSqlDialect {},
            LexicalRules::default(),
            "SELECT TOP 5 [name] FROM [SalesLT].[Product]"
        )
        .is_ok());

        let err = parse_single_query(&PostgreSqlDialect {}, pg, "SELECT 1; SELECT 2").unwrap_err();
        assert!(err.message.contains("Multiple"));

        let err = parse_single_query(&PostgreSqlDialect {}, pg, "DELETE FROM users").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);

        assert!(parse_single_query(&PostgreSqlDialect {}, pg, "SELECT * FROM").is_err());
        assert!(parse_single_query(&PostgreSqlDialect {}, pg, "SELECT 'abc").is_err());
    }

    #[test]
    fn test_unsupported_grammar_defers_to_server() {
        let pg = LexicalRules::for_dialect(Dialect::PostgreSql);

        let check = check_single_query(&PostgreSqlDialect {}, "SELECT a b c FROM t").unwrap();
        assert!(matches!(check, ParseCheck::Unsupported(_)));
        assert!(parse_single_query(&PostgreSqlDialect {}, pg, "SELECT a b c FROM t").is_ok());

        // Not a read, so the parser failure stands
        let err = parse_single_query(&PostgreSqlDialect {}, pg, "DELETE x y FROM t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }
}
