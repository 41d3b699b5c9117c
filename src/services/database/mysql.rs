// MySQL adapter using mysql_async connection pooling
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, SslOpts, Value as MySqlValue};
use serde_json::{json, Value};
use sqlparser::dialect::MySqlDialect;
use tracing::{debug, info, warn};

use super::adapter::{parse_single_query, query_timeout_error, AdapterState, DatabaseAdapter, PoolSlot};
use super::schema::{CatalogColumn, CatalogForeignKey, CatalogKey, SchemaBuilder};
use crate::models::{
    codes, BoxError, ConnectionSettings, DatabaseError, DbResult, Dialect, QueryResult, SchemaInfo,
    SchemaOptions, ServerInfo,
};
use crate::validation::sql_text::{self, LexicalRules};

const READ_ONLY_SESSION_SQL: &str = "SET SESSION TRANSACTION READ ONLY";

const COLUMNS_SQL: &str = r#"
    SELECT
        c.TABLE_NAME,
        c.COLUMN_NAME,
        c.COLUMN_TYPE,
        c.IS_NULLABLE,
        c.COLUMN_DEFAULT,
        c.EXTRA,
        c.ORDINAL_POSITION
    FROM information_schema.COLUMNS c
    JOIN information_schema.TABLES t
        ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
    WHERE c.TABLE_SCHEMA = DATABASE()
        AND (t.TABLE_TYPE = 'BASE TABLE' OR (? AND t.TABLE_TYPE = 'VIEW'))
    ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT k.TABLE_NAME, k.COLUMN_NAME
    FROM information_schema.KEY_COLUMN_USAGE k
    WHERE k.TABLE_SCHEMA = DATABASE() AND k.CONSTRAINT_NAME = 'PRIMARY'
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        k.TABLE_NAME,
        k.COLUMN_NAME,
        k.REFERENCED_TABLE_SCHEMA,
        k.REFERENCED_TABLE_NAME,
        k.REFERENCED_COLUMN_NAME
    FROM information_schema.KEY_COLUMN_USAGE k
    WHERE k.TABLE_SCHEMA = DATABASE() AND k.REFERENCED_TABLE_NAME IS NOT NULL
"#;

/// MySQL has no namespace below the database: tables are keyed by bare
/// name, and a foreign key into another database keeps that database as
/// its namespace.
pub struct MySqlAdapter {
    settings: ConnectionSettings,
    pool: PoolSlot<Pool>,
}

impl MySqlAdapter {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            pool: PoolSlot::new(),
        }
    }

    fn opts(&self) -> Opts {
        let s = &self.settings;
        let constraints = PoolConstraints::new(s.pool_min as usize, s.pool_max.max(1) as usize)
            .unwrap_or_default();
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_inactive_connection_ttl(s.idle_timeout);

        let mut builder = OptsBuilder::default()
            .ip_or_hostname(s.host.clone())
            .tcp_port(s.port)
            .user(Some(s.username.clone()))
            .pass(Some(s.password.clone()))
            .db_name(Some(s.database.clone()))
            // setup commands also run after every reset-on-return
            .setup(vec![READ_ONLY_SESSION_SQL])
            .pool_opts(pool_opts);

        if s.ssl.enabled {
            builder = builder.ssl_opts(
                SslOpts::default().with_danger_accept_invalid_certs(s.ssl.trust_server_certificate),
            );
        }

        builder.into()
    }

    /// Checkout bounded by the connect timeout; mysql_async has none of its own
    async fn get_conn(&self, pool: &Pool) -> DbResult<Conn> {
        match tokio::time::timeout(self.settings.connect_timeout, pool.get_conn()).await {
            Ok(conn) => conn.map_err(mysql_error),
            Err(_) => Err(DatabaseError::timeout(format!(
                "No MySQL connection available within {}s",
                self.settings.connect_timeout.as_secs()
            ))
            .with_code(codes::POOL_TIMEOUT)),
        }
    }

    async fn load_schema(&self, conn: &mut Conn, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let mut builder = SchemaBuilder::new();

        let rows: Vec<Row> = conn
            .exec(COLUMNS_SQL, (options.include_views,))
            .await
            .map_err(mysql_error)?;
        for row in &rows {
            let extra: String = column(row, 5)?;
            builder.column(CatalogColumn {
                namespace: None,
                table: column(row, 0)?,
                column: column(row, 1)?,
                data_type: column(row, 2)?,
                nullable: column::<String>(row, 3)? == "YES",
                default_value: column(row, 4)?,
                auto_increment: extra.to_lowercase().contains("auto_increment"),
                ordinal: column(row, 6)?,
            });
        }

        let rows: Vec<Row> = conn.query(PRIMARY_KEYS_SQL).await.map_err(mysql_error)?;
        for row in &rows {
            builder.primary_key(CatalogKey {
                namespace: None,
                table: column(row, 0)?,
                column: column(row, 1)?,
            });
        }

        let rows: Vec<Row> = conn.query(FOREIGN_KEYS_SQL).await.map_err(mysql_error)?;
        for row in &rows {
            let ref_schema: Option<String> = column(row, 2)?;
            builder.foreign_key(CatalogForeignKey {
                namespace: None,
                table: column(row, 0)?,
                column: column(row, 1)?,
                ref_namespace: ref_schema.filter(|schema| schema != &self.settings.database),
                ref_table: column(row, 3)?,
                ref_column: column(row, 4)?,
            });
        }

        Ok(builder.build())
    }
}

fn column<T: FromValue>(row: &Row, idx: usize) -> DbResult<T> {
    match row.get_opt::<T, usize>(idx) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(DatabaseError::query(format!("Unexpected catalog value in column {}: {}", idx, e))),
        None => Err(DatabaseError::query(format!("Catalog row has no column {}", idx))),
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    async fn state(&self) -> AdapterState {
        self.pool.state().await
    }

    async fn create_pool(&self) -> DbResult<()> {
        self.pool
            .open(|| async {
                let pool = Pool::new(self.opts());

                let verified = match self.get_conn(&pool).await {
                    Ok(mut conn) => conn.ping().await.map_err(mysql_error),
                    Err(e) => Err(e),
                };
                if let Err(e) = verified {
                    let _ = pool.disconnect().await;
                    return Err(e);
                }

                info!(
                    "Created MySQL pool for {}/{} (max_size: {})",
                    self.settings.address(),
                    self.settings.database,
                    self.settings.pool_max
                );
                Ok(pool)
            })
            .await
    }

    async fn close_pool(&self) -> DbResult<()> {
        if let Some(pool) = self.pool.close().await {
            pool.disconnect().await.map_err(mysql_error)?;
            info!(
                "Closed MySQL pool for {}/{}",
                self.settings.address(),
                self.settings.database
            );
        }
        Ok(())
    }

    async fn probe(&self) -> DbResult<ServerInfo> {
        let connect = Conn::new(self.opts());
        let mut conn = match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(conn) => conn.map_err(mysql_error)?,
            Err(_) => {
                return Err(DatabaseError::connection("Timed out connecting to MySQL")
                    .with_code(codes::TIMED_OUT))
            }
        };

        let rows: Vec<Row> = conn.query("SELECT VERSION(), DATABASE()").await.map_err(mysql_error)?;
        let _ = conn.disconnect().await;

        let row = rows
            .first()
            .ok_or_else(|| DatabaseError::query("Server returned no rows for the probe query"))?;
        let database: Option<String> = column(row, 1)?;

        Ok(ServerInfo {
            server_version: column(row, 0)?,
            database: database.unwrap_or_default(),
        })
    }

    async fn get_schema(&self, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let pool = self.pool.pool().await?;
        let mut conn = self.get_conn(&pool).await?;
        let schema = self.load_schema(&mut conn, options).await?;

        debug!(
            "Loaded MySQL schema: {} tables, {} relationships",
            schema.table_count(),
            schema.relationships.len()
        );
        Ok(schema)
    }

    async fn execute_with_timeout(&self, sql: &str, timeout_secs: u64) -> DbResult<QueryResult> {
        let pool = self.pool.pool().await?;
        let mut conn = self.get_conn(&pool).await?;

        if let Some(statement) = self.timeout_sql(timeout_secs) {
            conn.query_drop(statement).await.map_err(mysql_error)?;
        }

        let start_time = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let mut result = conn.query_iter(sql).await?;
            let columns: Vec<String> = result
                .columns_ref()
                .iter()
                .map(|c| c.name_str().to_string())
                .collect();
            let rows: Vec<Row> = result.collect().await?;
            Ok::<_, mysql_async::Error>((columns, rows))
        })
        .await;

        let (columns, rows) = match outcome {
            Ok(result) => result.map_err(mysql_error)?,
            Err(_) => {
                // A connection abandoned mid-result cannot go back to the pool
                match tokio::time::timeout(Duration::from_secs(5), conn.disconnect()).await {
                    Ok(Err(e)) => debug!("Error disconnecting timed out MySQL connection: {}", e),
                    Err(_) => debug!("Disconnect of timed out MySQL connection did not finish"),
                    Ok(Ok(())) => {}
                }
                warn!("MySQL query timed out after {}s; connection discarded", timeout_secs);
                return Err(query_timeout_error(timeout_secs));
            }
        };

        let json_rows = rows.into_iter().map(row_to_json).collect();
        Ok(QueryResult::new(columns, json_rows, start_time.elapsed().as_millis() as u64))
    }

    fn enforce_row_limit(&self, sql: &str, max_rows: u64) -> String {
        sql_text::enforce_trailing_limit(&self.sanitize_query(sql), max_rows)
    }

    fn timeout_sql(&self, timeout_secs: u64) -> Option<String> {
        Some(format!(
            "SET SESSION max_execution_time = {}",
            timeout_secs.saturating_mul(1000)
        ))
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("`{}`", identifier.replace('`', "``"))
    }

    fn validate_query(&self, sql: &str) -> DbResult<()> {
        parse_single_query(&MySqlDialect {}, LexicalRules::for_dialect(self.dialect()), &self.sanitize_query(sql))
    }

    fn sanitize_query(&self, sql: &str) -> String {
        sql_text::sanitize(sql, LexicalRules::for_dialect(self.dialect()))
    }

    fn map_error(&self, err: BoxError) -> DatabaseError {
        let err = match err.downcast::<mysql_async::Error>() {
            Ok(my) => return mysql_error(*my),
            Err(other) => other,
        };
        match err.downcast::<std::io::Error>() {
            Ok(io) => DatabaseError::from_io(&io).with_source(*io),
            Err(other) => DatabaseError::classify_message(&other.to_string()).with_source(other),
        }
    }
}

fn mysql_error(err: mysql_async::Error) -> DatabaseError {
    let mapped = match &err {
        mysql_async::Error::Server(server) => classify_server_code(server.code, &server.message),
        mysql_async::Error::Io(mysql_async::IoError::Io(io)) => DatabaseError::from_io(io),
        mysql_async::Error::Io(tls @ mysql_async::IoError::Tls(_)) => {
            DatabaseError::connection(tls.to_string()).with_code(codes::TLS_FAILED)
        }
        mysql_async::Error::Driver(driver) => {
            let classified = DatabaseError::classify_message(&driver.to_string());
            if classified.kind == crate::models::ErrorKind::Query {
                DatabaseError::connection(driver.to_string()).with_code(codes::CONNECTION_LOST)
            } else {
                classified
            }
        }
        mysql_async::Error::Url(url) => DatabaseError::config(url.to_string()),
        other => DatabaseError::classify_message(&other.to_string()),
    };
    mapped.with_source(err)
}

fn classify_server_code(code: u16, message: &str) -> DatabaseError {
    let mapped = match code {
        1044 | 1045 => DatabaseError::connection(message).with_code(codes::AUTH_FAILED),
        1049 => DatabaseError::connection(message).with_code(codes::UNKNOWN_DATABASE),
        1040 | 2006 | 2013 => DatabaseError::connection(message).with_code(codes::CONNECTION_LOST),
        1064 => DatabaseError::syntax(message),
        1054 | 1146 | 1305 => DatabaseError::syntax(message).with_code(codes::UNDEFINED_OBJECT),
        1205 | 1317 | 3024 => DatabaseError::timeout(message),
        1142 | 1143 | 1227 => DatabaseError::query(message).with_code(codes::PERMISSION_DENIED),
        _ => DatabaseError::query(message),
    };
    mapped.with_native_code(code)
}

/// Helper function to convert MySQL Value to JSON Value
fn mysql_value_to_json(mysql_val: MySqlValue) -> Value {
    match mysql_val {
        MySqlValue::NULL => Value::Null,
        MySqlValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => json!(s),
            // Binary columns
            Err(e) => json!(format!("0x{}", hex::encode(e.into_bytes()))),
        },
        MySqlValue::Int(i) => json!(i),
        MySqlValue::UInt(u) => json!(u),
        MySqlValue::Float(f) => json!(f),
        MySqlValue::Double(d) => json!(d),
        MySqlValue::Date(y, m, d, 0, 0, 0, 0) => json!(format!("{:04}-{:02}-{:02}", y, m, d)),
        MySqlValue::Date(y, m, d, h, min, s, 0) => {
            json!(format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, h, min, s))
        }
        MySqlValue::Date(y, m, d, h, min, s, micros) => json!(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, m, d, h, min, s, micros
        )),
        MySqlValue::Time(is_neg, d, h, m, s, _) => {
            let sign = if is_neg { "-" } else { "" };
            let total_hours = d * 24 + h as u32;
            json!(format!("{}{}:{:02}:{:02}", sign, total_hours, m, s))
        }
    }
}

fn row_to_json(row: Row) -> Value {
    let mut row_obj = serde_json::Map::new();
    let columns = row.columns();
    for (column, value) in columns.iter().zip(row.unwrap_raw()) {
        let value = value.map(mysql_value_to_json).unwrap_or(Value::Null);
        row_obj.insert(column.name_str().to_string(), value);
    }
    Value::Object(row_obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;

    fn adapter() -> MySqlAdapter {
        let mut settings = ConnectionSettings::file(Dialect::MySql, "shop");
        settings.host = "localhost".into();
        settings.port = 3306;
        MySqlAdapter::new(settings)
    }

    #[test]
    fn test_row_limit() {
        let my = adapter();
        assert_eq!(my.enforce_row_limit("SELECT * FROM orders # all of them", 50), "SELECT * FROM orders LIMIT 50");
        assert_eq!(my.enforce_row_limit("SELECT * FROM orders LIMIT 20, 500;", 50), "SELECT * FROM orders LIMIT 20, 50");
        assert_eq!(my.enforce_row_limit("SELECT * FROM orders LIMIT 7", 50), "SELECT * FROM orders LIMIT 7");

        let once = my.enforce_row_limit("SELECT * FROM orders", 50);
        assert_eq!(my.enforce_row_limit(&once, 50), once);
    }

    #[test]
    fn test_sessions_start_read_only() {
        let opts = adapter().opts();
        assert_eq!(opts.setup().to_vec(), vec![READ_ONLY_SESSION_SQL.to_string()]);
    }

    #[test]
    fn test_timeout_sql_and_quoting() {
        let my = adapter();
        assert_eq!(my.timeout_sql(2).as_deref(), Some("SET SESSION max_execution_time = 2000"));
        assert_eq!(my.quote_identifier("order"), "`order`");
        assert_eq!(my.quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn test_validate_query() {
        let my = adapter();
        assert!(my.validate_query("SELECT `id` FROM `orders` LIMIT 5, 10").is_ok());
        assert!(my.validate_query("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_classify_server_code() {
        let err = classify_server_code(1045, "Access denied for user 'app'@'%'");
        assert!(err.is_connection());
        assert_eq!(err.code.as_deref(), Some(codes::AUTH_FAILED));
        assert_eq!(err.native_code.as_deref(), Some("1045"));

        assert_eq!(classify_server_code(1049, "Unknown database 'x'").code.as_deref(), Some(codes::UNKNOWN_DATABASE));
        assert!(classify_server_code(1064, "You have an error in your SQL syntax").is_syntax());
        assert!(classify_server_code(1146, "Table 'shop.nope' doesn't exist").is_syntax());
        assert!(classify_server_code(3024, "maximum statement execution time exceeded").is_timeout());
        assert!(classify_server_code(2013, "Lost connection to MySQL server during query").is_connection());
        assert_eq!(classify_server_code(1365, "Division by 0").kind, ErrorKind::Query);
    }

    #[test]
    fn test_io_errors_keep_socket_codes() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = mysql_error(mysql_async::Error::Io(mysql_async::IoError::Io(refused)));
        assert!(err.is_connection());
        assert_eq!(err.code.as_deref(), Some(codes::CONNECTION_REFUSED));
    }

    #[test]
    fn test_mysql_value_to_json() {
        assert_eq!(mysql_value_to_json(MySqlValue::NULL), Value::Null);
        assert_eq!(mysql_value_to_json(MySqlValue::Int(-3)), json!(-3));
        assert_eq!(mysql_value_to_json(MySqlValue::Bytes(b"hello".to_vec())), json!("hello"));
        assert_eq!(mysql_value_to_json(MySqlValue::Bytes(vec![0xff, 0x00])), json!("0xff00"));
        assert_eq!(mysql_value_to_json(MySqlValue::Date(2024, 2, 29, 0, 0, 0, 0)), json!("2024-02-29"));
        assert_eq!(
            mysql_value_to_json(MySqlValue::Date(2024, 2, 29, 13, 5, 9, 0)),
            json!("2024-02-29 13:05:09")
        );
        assert_eq!(mysql_value_to_json(MySqlValue::Time(true, 1, 2, 3, 4, 0)), json!("-26:03:04"));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let my = adapter();
        let err = my.execute_with_timeout("SELECT 1", 5).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);

        my.close_pool().await.unwrap();
        let err = my.get_schema(&SchemaOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedOperation);
    }
}
