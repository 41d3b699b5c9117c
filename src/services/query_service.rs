use std::time::Instant;

use crate::models::{DbResult, Dialect, QueryExecution, QueryOptions};
use crate::services::database::DatabaseAdapter;
use crate::services::retry::{RetryPolicy, RetryService};
use crate::validation::{QuerySafetyValidator, ValidationReport};

/// Validated, row-limited, retried query execution against one adapter
pub struct QueryService {
    validator: QuerySafetyValidator,
    retry: RetryPolicy,
}

impl Default for QueryService {
    fn default() -> Self {
        Self::new(QuerySafetyValidator::default(), RetryPolicy::query_execution())
    }
}

impl QueryService {
    pub fn new(validator: QuerySafetyValidator, retry: RetryPolicy) -> Self {
        Self { validator, retry }
    }

    pub fn validator(&self) -> &QuerySafetyValidator {
        &self.validator
    }

    pub fn validate(&self, sql: &str, dialect: Dialect) -> ValidationReport {
        self.validator.validate(sql, dialect)
    }

    /// Run `sql` after the safety checks pass. Unsafe or malformed SQL is
    /// rejected before any connection is used.
    ///
    /// The timeout is the caller's, or the tier recommended for the
    /// statement's complexity.
    pub async fn execute(
        &self,
        adapter: &dyn DatabaseAdapter,
        sql: &str,
        options: &QueryOptions,
    ) -> DbResult<QueryExecution> {
        let start_time = Instant::now();

        let prepared = self.validator.prepare(sql, adapter, options.max_rows)?;
        let timeout_secs = options
            .timeout_secs
            .unwrap_or(prepared.report.recommended_timeout_secs);

        if prepared.limit_applied {
            tracing::debug!("Row limit {} applied: {}", prepared.max_rows, prepared.sql);
        }

        let retry = RetryService::new(self.retry.clone());
        let outcome = retry
            .run("execute_query", || adapter.execute_with_timeout(&prepared.sql, timeout_secs))
            .await;
        let attempts = outcome.attempts;

        let result = outcome.into_result().map_err(|e| {
            tracing::error!(
                dialect = %adapter.dialect(),
                attempts,
                error = %e,
                "Query execution failed"
            );
            e
        })?;

        tracing::info!(
            dialect = %adapter.dialect(),
            rows = result.row_count,
            execution_time_ms = result.execution_time_ms,
            attempts,
            "Query executed"
        );

        let mut execution = QueryExecution::new(prepared.original_sql, prepared.sql, result);
        execution.limit_applied = prepared.limit_applied;
        execution.complexity = prepared.report.complexity;
        execution.warnings = prepared.report.warnings;
        execution.timeout_secs = timeout_secs;
        execution.attempts = attempts;
        execution.total_time_ms = start_time.elapsed().as_millis() as u64;
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionSettings, ErrorKind};
    use crate::services::database::SqliteAdapter;
    use rusqlite::Connection;
    use serde_json::json;
    use tempfile::TempDir;

    async fn connected() -> (TempDir, SqliteAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL);
             WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 50)
             INSERT INTO orders (total) SELECT i * 1.5 FROM n;",
        )
        .unwrap();
        drop(conn);

        let adapter = SqliteAdapter::new(ConnectionSettings::file(
            Dialect::Sqlite,
            path.to_string_lossy().into_owned(),
        ));
        adapter.create_pool().await.unwrap();
        (dir, adapter)
    }

    #[tokio::test]
    async fn test_execute_applies_limit_and_reports() {
        let (_dir, adapter) = connected().await;
        let service = QueryService::default();

        let options = QueryOptions::default().with_max_rows(10);
        let execution = service
            .execute(&adapter, "SELECT * FROM orders ORDER BY id;", &options)
            .await
            .unwrap();

        assert!(execution.limit_applied);
        assert_eq!(execution.executed_sql, "SELECT * FROM orders ORDER BY id LIMIT 10");
        assert_eq!(execution.original_sql, "SELECT * FROM orders ORDER BY id;");
        assert_eq!(execution.result.row_count, 10);
        assert_eq!(execution.result.rows[1]["total"], json!(3.0));
        assert_eq!(execution.attempts, 1);
        assert_eq!(execution.timeout_secs, 30);
    }

    #[tokio::test]
    async fn test_caller_timeout_wins() {
        let (_dir, adapter) = connected().await;
        let service = QueryService::default();

        let options = QueryOptions::default().with_timeout(5);
        let execution = service
            .execute(&adapter, "SELECT count(*) AS n FROM orders LIMIT 5", &options)
            .await
            .unwrap();
        assert!(!execution.limit_applied);
        assert_eq!(execution.timeout_secs, 5);
        assert_eq!(execution.result.rows[0]["n"], json!(50));
    }

    #[tokio::test]
    async fn test_unsafe_sql_never_reaches_the_database() {
        let service = QueryService::default();
        // Never connected: reaching the pool would yield a Config error
        let adapter = SqliteAdapter::new(ConnectionSettings::file(Dialect::Sqlite, "unused.db"));

        let err = service
            .execute(&adapter, "DELETE FROM orders", &QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let err = service
            .execute(&adapter, "SELECT * FROM orders WHERE", &QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[tokio::test]
    async fn test_engine_errors_are_not_retried() {
        let (_dir, adapter) = connected().await;
        let service = QueryService::default();

        let err = service
            .execute(&adapter, "SELECT missing_column FROM orders", &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_syntax());
        assert!(err.details.is_empty());
    }
}
