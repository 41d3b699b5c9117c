// SQL Server adapter: tiberius over a bb8 pool
use std::borrow::Cow;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bb8::{ManageConnection, Pool, RunError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use sqlparser::dialect::MsSqlDialect;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use super::adapter::{parse_single_query, query_timeout_error, AdapterState, DatabaseAdapter, PoolSlot};
use super::schema::{CatalogColumn, CatalogForeignKey, CatalogKey, SchemaBuilder};
use crate::models::{
    codes, BoxError, ConnectionSettings, DatabaseError, DbResult, Dialect, QueryResult, SchemaInfo,
    SchemaOptions, ServerInfo,
};
use crate::validation::sql_text::{self, LexicalRules};

type TdsClient = Client<Compat<TcpStream>>;
type TdsError = tiberius::error::Error;

const COLUMNS_SQL: &str = r#"
SELECT s.name, o.name, c.name, ty.name, c.is_nullable, dc.definition, c.is_identity, c.column_id
FROM sys.columns c
JOIN sys.objects o ON o.object_id = c.object_id
JOIN sys.schemas s ON s.schema_id = o.schema_id
JOIN sys.types ty ON ty.user_type_id = c.user_type_id
LEFT JOIN sys.default_constraints dc ON dc.object_id = c.default_object_id
WHERE o.is_ms_shipped = 0
  AND (o.type = 'U' OR (@P1 = 1 AND o.type = 'V'))
ORDER BY s.name, o.name, c.column_id
"#;

const PRIMARY_KEYS_SQL: &str = r#"
SELECT s.name, t.name, c.name
FROM sys.indexes i
JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id
JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
JOIN sys.tables t ON t.object_id = i.object_id
JOIN sys.schemas s ON s.schema_id = t.schema_id
WHERE i.is_primary_key = 1 AND t.is_ms_shipped = 0
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT ps.name, pt.name, pc.name, rs.name, rt.name, rc.name
FROM sys.foreign_key_columns fkc
JOIN sys.tables pt ON pt.object_id = fkc.parent_object_id
JOIN sys.schemas ps ON ps.schema_id = pt.schema_id
JOIN sys.columns pc ON pc.object_id = fkc.parent_object_id AND pc.column_id = fkc.parent_column_id
JOIN sys.tables rt ON rt.object_id = fkc.referenced_object_id
JOIN sys.schemas rs ON rs.schema_id = rt.schema_id
JOIN sys.columns rc ON rc.object_id = fkc.referenced_object_id AND rc.column_id = fkc.referenced_column_id
"#;

/// `SELECT [DISTINCT|ALL] TOP n [PERCENT]` right after the SELECT keyword
static TOP_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\s+(?:distinct|all)\b)?\s+top\s*(?:\(\s*(\d+)\s*\)|(\d+))(\s+percent\b)?")
        .expect("TOP clause regex is valid")
});

static SELECT_MODIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s+(?:distinct|all)\b").expect("modifier regex is valid"));

static FETCH_NEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\boffset\s+\d+\s+rows?\s+fetch\s+(?:next|first)\s+(\d+)\s+rows?\s+only\s*$")
        .expect("FETCH regex is valid")
});

/// A pooled client plus a flag that keeps bb8 from reusing it after an
/// abandoned request
pub struct MssqlConnection {
    client: TdsClient,
    broken: bool,
}

pub struct MssqlManager {
    config: Config,
}

#[async_trait]
impl ManageConnection for MssqlManager {
    type Connection = MssqlConnection;
    type Error = TdsError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let client = connect_client(self.config.clone()).await?;
        Ok(MssqlConnection { client, broken: false })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

async fn connect_client(config: Config) -> Result<TdsClient, TdsError> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;

    match Client::connect(config.clone(), tcp.compat_write()).await {
        // Azure SQL gateways redirect to the actual node once
        Err(TdsError::Routing { host, port }) => {
            let mut config = config;
            config.host(&host);
            config.port(port);
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Client::connect(config, tcp.compat_write()).await
        }
        result => result,
    }
}

pub struct SqlServerAdapter {
    settings: ConnectionSettings,
    pool: PoolSlot<Pool<MssqlManager>>,
}

impl SqlServerAdapter {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            pool: PoolSlot::new(),
        }
    }

    fn tds_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.settings.host);
        config.port(self.settings.port);
        config.database(&self.settings.database);
        config.application_name("db-query-core");
        config.authentication(AuthMethod::sql_server(&self.settings.username, &self.settings.password));

        if self.settings.ssl.enabled {
            config.encryption(EncryptionLevel::Required);
            if self.settings.ssl.trust_server_certificate {
                config.trust_cert();
            }
        } else {
            config.encryption(EncryptionLevel::Off);
        }
        config
    }

    async fn load_schema(&self, client: &mut TdsClient, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let mut builder = SchemaBuilder::new().with_namespaces(&options.namespaces);

        let rows = client
            .query(COLUMNS_SQL, &[&options.include_views])
            .await
            .map_err(mssql_error)?
            .into_first_result()
            .await
            .map_err(mssql_error)?;
        for row in &rows {
            builder.column(CatalogColumn {
                namespace: Some(text(row, 0)?),
                table: text(row, 1)?,
                column: text(row, 2)?,
                data_type: text(row, 3)?,
                nullable: flag(row, 4)?,
                default_value: row.try_get::<&str, _>(5).map_err(mssql_error)?.map(str::to_string),
                auto_increment: flag(row, 6)?,
                ordinal: row.try_get::<i32, _>(7).map_err(mssql_error)?.unwrap_or_default() as i64,
            });
        }

        let rows = simple_rows(client, PRIMARY_KEYS_SQL).await?;
        for row in &rows {
            builder.primary_key(CatalogKey {
                namespace: Some(text(row, 0)?),
                table: text(row, 1)?,
                column: text(row, 2)?,
            });
        }

        let rows = simple_rows(client, FOREIGN_KEYS_SQL).await?;
        for row in &rows {
            builder.foreign_key(CatalogForeignKey {
                namespace: Some(text(row, 0)?),
                table: text(row, 1)?,
                column: text(row, 2)?,
                ref_namespace: Some(text(row, 3)?),
                ref_table: text(row, 4)?,
                ref_column: text(row, 5)?,
            });
        }

        Ok(builder.build())
    }
}

async fn simple_rows(client: &mut TdsClient, sql: &str) -> DbResult<Vec<Row>> {
    client
        .simple_query(sql)
        .await
        .map_err(mssql_error)?
        .into_first_result()
        .await
        .map_err(mssql_error)
}

fn text(row: &Row, idx: usize) -> DbResult<String> {
    row.try_get::<&str, _>(idx)
        .map_err(mssql_error)?
        .map(str::to_string)
        .ok_or_else(|| DatabaseError::query(format!("Unexpected NULL in catalog column {}", idx)))
}

fn flag(row: &Row, idx: usize) -> DbResult<bool> {
    Ok(row.try_get::<bool, _>(idx).map_err(mssql_error)?.unwrap_or(false))
}

async fn run_statement(client: &mut TdsClient, sql: &str) -> Result<(Vec<String>, Vec<Row>), TdsError> {
    let mut stream = client.simple_query(sql).await?;
    let columns = stream
        .columns()
        .await?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = stream.into_first_result().await?;
    Ok((columns, rows))
}

#[async_trait]
impl DatabaseAdapter for SqlServerAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::SqlServer
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
                let manager = MssqlManager {
                    config: self.tds_config(),
                };
                let max_size = self.settings.pool_max.max(1);
                let pool = Pool::builder()
                    .max_size(max_size)
                    .min_idle(Some(self.settings.pool_min.min(max_size)))
                    .connection_timeout(self.settings.connect_timeout)
                    .idle_timeout(Some(self.settings.idle_timeout))
                    .build(manager)
                    .await
                    .map_err(mssql_error)?;

                // Verify connectivity before publishing the pool
                drop(pool.get().await.map_err(run_error)?);

                info!(
                    "Created SQL Server pool for {} (max_size: {})",
                    self.settings.address(),
                    max_size
                );
                Ok(pool)
            })
            .await
    }

    async fn close_pool(&self) -> DbResult<()> {
        // bb8 closes idle connections once the last pool handle drops
        if let Some(pool) = self.pool.close().await {
            let state = pool.state();
            drop(pool);
            info!(
                "Closed SQL Server pool for {} ({} connections)",
                self.settings.address(),
                state.connections
            );
        }
        Ok(())
    }

    async fn probe(&self) -> DbResult<ServerInfo> {
        let connect = connect_client(self.tds_config());
        let mut client = tokio::time::timeout(self.settings.connect_timeout, connect)
            .await
            .map_err(|_| {
                DatabaseError::timeout(format!("Connecting to {} timed out", self.settings.address()))
                    .with_code(codes::TIMED_OUT)
            })?
            .map_err(mssql_error)?;

        let row = client
            .simple_query("SELECT @@VERSION, DB_NAME()")
            .await
            .map_err(mssql_error)?
            .into_row()
            .await
            .map_err(mssql_error)?;

        let info = match &row {
            Some(row) => ServerInfo {
                server_version: text(row, 0)?.lines().next().unwrap_or_default().trim().to_string(),
                database: text(row, 1)?,
            },
            None => return Err(DatabaseError::query("Server returned no version row")),
        };

        if let Err(e) = client.close().await {
            debug!("Error closing probe connection: {}", e);
        }
        Ok(info)
    }

    async fn get_schema(&self, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let pool = self.pool.pool().await?;
        let mut conn = pool.get().await.map_err(run_error)?;
        let schema = self.load_schema(&mut conn.client, options).await;
        if matches!(&schema, Err(e) if e.is_connection()) {
            conn.broken = true;
        }
        schema
    }

    async fn execute_with_timeout(&self, sql: &str, timeout_secs: u64) -> DbResult<QueryResult> {
        let pool = self.pool.pool().await?;
        let mut conn = pool.get().await.map_err(run_error)?;
        let start_time = Instant::now();
        let lock_timeout = self.timeout_sql(timeout_secs);

        let work = async {
            if let Some(set_timeout) = &lock_timeout {
                conn.client.simple_query(set_timeout.as_str()).await?.into_results().await?;
            }
            let result = run_statement(&mut conn.client, sql).await?;
            conn.client.simple_query("SET LOCK_TIMEOUT -1").await?.into_results().await?;
            Ok::<_, TdsError>(result)
        };

        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), work).await;
        let (columns, rows) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let err = mssql_error(e);
                if err.is_connection() {
                    conn.broken = true;
                }
                return Err(err);
            }
            Err(_) => {
                // The request may still be in flight on this socket
                conn.broken = true;
                warn!("SQL Server query timed out after {}s; discarding connection", timeout_secs);
                return Err(query_timeout_error(timeout_secs));
            }
        };

        let json_rows = rows
            .into_iter()
            .map(|row| {
                let row_obj: serde_json::Map<String, Value> = columns
                    .iter()
                    .cloned()
                    .zip(row.into_iter().map(column_to_json))
                    .collect();
                Value::Object(row_obj)
            })
            .collect();

        Ok(QueryResult::new(columns, json_rows, start_time.elapsed().as_millis() as u64))
    }

    /// `TOP n` after the outermost SELECT, or a clamped or appended
    /// `FETCH NEXT` where the statement pages with `OFFSET`
    fn enforce_row_limit(&self, sql: &str, max_rows: u64) -> String {
        let sql = self.sanitize_query(sql);

        if let Some(count) = FETCH_NEXT.captures(&sql).and_then(|caps| caps.get(1)) {
            if matches!(count.as_str().parse::<u64>(), Ok(n) if n <= max_rows) {
                return sql;
            }
            return format!("{}{}{}", &sql[..count.start()], max_rows, &sql[count.end()..]);
        }

        let top_level = |keyword: &str| sql_text::find_top_level_keyword(&sql, keyword).is_some();

        // TOP cannot share a query with OFFSET
        if top_level("offset") {
            return format!("{} FETCH NEXT {} ROWS ONLY", sql, max_rows);
        }

        if ["union", "except", "intersect"].iter().any(|kw| top_level(kw)) {
            // A derived table cannot keep the ORDER BY, so page the ordered result
            if top_level("order") {
                return format!("{} OFFSET 0 ROWS FETCH NEXT {} ROWS ONLY", sql, max_rows);
            }
            return format!("SELECT TOP {} * FROM ({}) AS limited_rows", max_rows, sql);
        }

        let Some(select_at) = sql_text::find_top_level_keyword(&sql, "select") else {
            return sql;
        };
        let after_select = select_at + "select".len();
        let rest = &sql[after_select..];

        if let Some(caps) = TOP_CLAUSE.captures(rest) {
            let percent = caps.get(4).is_some();
            let count = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str().parse::<u64>());
            if !percent && matches!(count, Some(Ok(n)) if n <= max_rows) {
                return sql;
            }
            let modifier_end = caps.get(1).map_or(0, |m| m.end());
            let clause_end = caps.get(0).map_or(0, |m| m.end());
            return format!(
                "{}{} TOP {}{}",
                &sql[..after_select],
                &rest[..modifier_end],
                max_rows,
                &rest[clause_end..]
            );
        }

        let insert_at = after_select + SELECT_MODIFIER.find(rest).map_or(0, |m| m.end());
        format!("{} TOP {}{}", &sql[..insert_at], max_rows, &sql[insert_at..])
    }

    /// Lock waits are the only session-scoped deadline T-SQL offers; the
    /// wall-clock cutoff covers everything else
    fn timeout_sql(&self, timeout_secs: u64) -> Option<String> {
        let millis = timeout_secs.saturating_mul(1000).min(i32::MAX as u64);
        Some(format!("SET LOCK_TIMEOUT {}", millis))
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("[{}]", identifier.replace(']', "]]"))
    }

    fn validate_query(&self, sql: &str) -> DbResult<()> {
        parse_single_query(&MsSqlDialect {}, LexicalRules::for_dialect(self.dialect()), &self.sanitize_query(sql))
    }

    fn sanitize_query(&self, sql: &str) -> String {
        sql_text::sanitize(sql, LexicalRules::for_dialect(self.dialect()))
    }

    fn map_error(&self, err: BoxError) -> DatabaseError {
        let err = match err.downcast::<TdsError>() {
            Ok(tds) => return mssql_error(*tds),
            Err(other) => other,
        };
        match err.downcast::<RunError<TdsError>>() {
            Ok(run) => run_error(*run),
            Err(other) => DatabaseError::classify_message(&other.to_string()).with_source(other),
        }
    }
}

fn run_error(err: RunError<TdsError>) -> DatabaseError {
    match err {
        RunError::User(e) => mssql_error(e),
        RunError::TimedOut => {
            DatabaseError::timeout("Timed out waiting for a pooled SQL Server connection")
                .with_code(codes::POOL_TIMEOUT)
        }
    }
}

fn mssql_error(err: TdsError) -> DatabaseError {
    let mapped = match &err {
        TdsError::Server(token) => classify_server_code(token.code(), token.message()),
        TdsError::Io { kind, message } => DatabaseError::from_io(&std::io::Error::new(*kind, message.clone())),
        TdsError::Tls(message) => {
            DatabaseError::connection(format!("TLS handshake failed: {}", message)).with_code(codes::TLS_FAILED)
        }
        TdsError::Routing { host, port } => {
            DatabaseError::connection(format!("Server redirected to {}:{}", host, port))
        }
        TdsError::Protocol(message) => {
            DatabaseError::connection(message.to_string()).with_code(codes::CONNECTION_LOST)
        }
        other => DatabaseError::classify_message(&other.to_string()),
    };
    mapped.with_source(err)
}

fn classify_server_code(code: u32, message: &str) -> DatabaseError {
    let err = match code {
        18456 | 18452 => DatabaseError::connection(message).with_code(codes::AUTH_FAILED),
        4060 => DatabaseError::connection(message).with_code(codes::UNKNOWN_DATABASE),
        233 | 10054 => DatabaseError::connection(message).with_code(codes::CONNECTION_LOST),
        102 | 105 | 156 | 170 => DatabaseError::syntax(message),
        207 | 208 | 2812 | 4121 => DatabaseError::syntax(message).with_code(codes::UNDEFINED_OBJECT),
        1222 => DatabaseError::timeout(message),
        229 | 230 | 262 | 297 | 300 => DatabaseError::query(message).with_code(codes::PERMISSION_DENIED),
        _ => DatabaseError::query(message),
    };
    err.with_native_code(code)
}

fn temporal_to_json(data: &ColumnData<'static>) -> Value {
    let formatted = match data {
        ColumnData::Date(_) => NaiveDate::from_sql(data).map(|d| d.map(|d| d.to_string())),
        ColumnData::Time(_) => NaiveTime::from_sql(data).map(|t| t.map(|t| t.to_string())),
        ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(data).map(|dt| dt.map(|dt| dt.to_rfc3339())),
        _ => NaiveDateTime::from_sql(data).map(|dt| dt.map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
    };
    match formatted {
        Ok(Some(s)) => json!(s),
        _ => Value::Null,
    }
}

fn column_to_json(data: ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map_or(Value::Null, |v| json!(v)),
        ColumnData::I16(v) => v.map_or(Value::Null, |v| json!(v)),
        ColumnData::I32(v) => v.map_or(Value::Null, |v| json!(v)),
        ColumnData::I64(v) => v.map_or(Value::Null, |v| json!(v)),
        ColumnData::F32(v) => v.map_or(Value::Null, |v| json!(v)),
        ColumnData::F64(v) => v.map_or(Value::Null, |v| json!(v)),
        ColumnData::Bit(v) => v.map_or(Value::Null, |v| json!(v)),
        ColumnData::String(v) => v.map_or(Value::Null, |s: Cow<'_, str>| json!(s)),
        ColumnData::Guid(v) => v.map_or(Value::Null, |g| json!(g.to_string())),
        ColumnData::Binary(v) => v.map_or(Value::Null, |b| json!(format!("0x{}", hex::encode(b.as_ref())))),
        // Exact decimal text; f64 would round money and high-scale values
        ColumnData::Numeric(v) => v.map_or(Value::Null, |n| json!(n.to_string())),
        ColumnData::Xml(v) => v.map_or(Value::Null, |x| json!(x.into_owned().into_string())),
        temporal => temporal_to_json(&temporal),
    }
}
