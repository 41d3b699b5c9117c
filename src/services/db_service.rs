use std::sync::Arc;

use crate::models::{
    ConnectionConfig, DatabaseError, DbResult, Dialect, QueryExecution, QueryOptions, SchemaInfo, SchemaOptions,
    TestConnectionResult,
};
use crate::services::connection_pool::{CacheStats, ConnectionPoolCache};
use crate::services::query_service::QueryService;
use crate::services::retry::RetryPolicy;
use crate::validation::ValidationReport;

/// Entry point for callers: resolves a connection through the pool cache
/// and runs introspection or queries on it
pub struct DbService {
    cache: Arc<ConnectionPoolCache>,
    queries: QueryService,
    connection_test: RetryPolicy,
}

impl DbService {
    pub fn new(cache: Arc<ConnectionPoolCache>, queries: QueryService) -> Self {
        Self {
            cache,
            queries,
            connection_test: RetryPolicy::connection_test(),
        }
    }

    pub fn with_connection_test_policy(mut self, policy: RetryPolicy) -> Self {
        self.connection_test = policy;
        self
    }

    pub fn cache(&self) -> &Arc<ConnectionPoolCache> {
        &self.cache
    }

    /// Throwaway round trip outside the cache. Invalid configuration is
    /// reported in the result, never as an error.
    pub async fn test_connection(&self, config: ConnectionConfig) -> TestConnectionResult {
        tracing::info!("Testing {} connection to {}", config.dialect, config.database);

        match self.cache.factory().create(config) {
            Ok(adapter) => adapter.test_connection(&self.connection_test).await,
            Err(e) => TestConnectionResult::failed(&DatabaseError::from(e), 0),
        }
    }

    pub async fn get_schema(&self, config: ConnectionConfig, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let key = config.cache_key();
        let adapter = self.cache.get(config).await?;

        let schema = adapter.get_schema(options).await;
        self.drop_if_disconnected(&key, &schema).await;
        let schema = schema?;

        tracing::info!(
            "Loaded {} schema: {} tables, {} relationships",
            adapter.dialect(),
            schema.table_count(),
            schema.relationships.len()
        );
        Ok(schema)
    }

    pub async fn execute_query(
        &self,
        config: ConnectionConfig,
        sql: &str,
        options: &QueryOptions,
    ) -> DbResult<QueryExecution> {
        let key = config.cache_key();
        let adapter = self.cache.get(config).await?;

        let execution = self.queries.execute(adapter.as_ref(), sql, options).await;
        self.drop_if_disconnected(&key, &execution).await;
        execution
    }

    /// Safety report only; nothing is executed
    pub fn validate(&self, sql: &str, dialect: Dialect) -> ValidationReport {
        self.queries.validate(sql, dialect)
    }

    pub async fn invalidate(&self, config: &ConnectionConfig) -> bool {
        self.cache.invalidate(config).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Close every cached pool
    pub async fn shutdown(&self) -> usize {
        self.cache.clear_all().await
    }

    /// A pool that lost its server is recreated on next use
    async fn drop_if_disconnected<T>(&self, key: &str, result: &DbResult<T>) {
        if let Err(e) = result {
            if e.is_connection() && self.cache.invalidate_key(key).await {
                tracing::warn!("Dropped cached pool for {} after connection error: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;
    use crate::services::connection_pool::PoolCacheConfig;
    use crate::services::database::DefaultAdapterFactory;
    use rusqlite::Connection;
    use serde_json::json;
    use tempfile::TempDir;

    fn service() -> DbService {
        let cache = ConnectionPoolCache::new(
            Arc::new(DefaultAdapterFactory::new()),
            PoolCacheConfig::default(),
            RetryPolicy::no_retry(),
        );
        DbService::new(Arc::new(cache), QueryService::default()).with_connection_test_policy(RetryPolicy::no_retry())
    }

    fn database() -> (TempDir, ConnectionConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crm.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
             CREATE TABLE invoices (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id));
             INSERT INTO customers (email) VALUES ('a@example.com'), ('b@example.com');
             INSERT INTO invoices (customer_id) VALUES (1), (1), (2);",
        )
        .unwrap();
        drop(conn);

        let config = ConnectionConfig::new("sqlite", path.to_string_lossy().into_owned());
        (dir, config)
    }

    #[tokio::test]
    async fn test_schema_and_query_share_one_pool() {
        let (_dir, config) = database();
        let service = service();

        let schema = service.get_schema(config.clone(), &SchemaOptions::default()).await.unwrap();
        assert_eq!(schema.table_count(), 2);
        assert_eq!(schema.relationships[0].from, "invoices");

        let execution = service
            .execute_query(
                config.clone(),
                "SELECT c.email, count(*) AS n FROM customers c JOIN invoices i ON i.customer_id = c.id GROUP BY c.email ORDER BY c.email",
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(execution.result.rows[0], json!({"email": "a@example.com", "n": 2}));
        assert!(execution.limit_applied);

        let stats = service.cache_stats().await;
        assert_eq!((stats.size, stats.hits, stats.misses), (1, 1, 1));

        assert!(service.invalidate(&config).await);
        assert_eq!(service.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_connection_reports_instead_of_failing() {
        let (_dir, config) = database();
        let service = service();

        let result = service.test_connection(config).await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(service.cache_stats().await.size, 0);

        let result = service.test_connection(ConnectionConfig::new("db2", "x")).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_rejected_sql_is_reported() {
        let (_dir, config) = database();
        let service = service();

        let report = service.validate("DROP TABLE customers", Dialect::Sqlite);
        assert!(!report.safe);

        let err = service
            .execute_query(config, "DROP TABLE customers", &QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.details.is_empty());
    }
}
