// SQLite adapter. Files are opened read-only and every call runs on the
// blocking thread pool; a deadpool-managed pool bounds concurrency.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use futures::future::try_join_all;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde_json::{json, Value};
use sqlparser::dialect::SQLiteDialect;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use super::adapter::{check_single_query, query_timeout_error, AdapterState, DatabaseAdapter, ParseCheck, PoolSlot};
use super::schema::{CatalogColumn, CatalogForeignKey, CatalogKey, SchemaBuilder};
use crate::models::{
    codes, BoxError, ConnectionSettings, DatabaseError, DbResult, Dialect, QueryResult, SchemaInfo,
    SchemaOptions, ServerInfo,
};
use crate::validation::sql_text::{self, LexicalRules};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens read-only connections to one database file
#[derive(Debug)]
pub struct SqliteManager {
    path: String,
}

impl managed::Manager for SqliteManager {
    type Type = Connection;
    type Error = DatabaseError;

    async fn create(&self) -> Result<Connection, DatabaseError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || open_read_only(&path))
            .await
            .map_err(join_error)?
    }

    async fn recycle(&self, conn: &mut Connection, _: &Metrics) -> RecycleResult<DatabaseError> {
        // A statement abandoned mid-transaction leaves the connection unusable
        if conn.is_autocommit() {
            Ok(())
        } else {
            Err(RecycleError::message("SQLite connection left inside a transaction"))
        }
    }
}

pub type SqlitePool = managed::Pool<SqliteManager>;
type PooledSqlite = managed::Object<SqliteManager>;

pub struct SqliteAdapter {
    settings: ConnectionSettings,
    pool: PoolSlot<SqlitePool>,
}

impl SqliteAdapter {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            pool: PoolSlot::new(),
        }
    }

    fn build_pool(&self) -> DbResult<SqlitePool> {
        let s = &self.settings;
        let manager = SqliteManager {
            path: s.database.clone(),
        };

        SqlitePool::builder(manager)
            .max_size(s.pool_max.max(1) as usize)
            .wait_timeout(Some(s.connect_timeout))
            .create_timeout(Some(s.connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DatabaseError::config(format!("Failed to create connection pool: {}", e)))
    }

    async fn checkout(&self, pool: &SqlitePool) -> DbResult<PooledSqlite> {
        pool.get().await.map_err(map_pool_error)
    }
}

fn map_pool_error(err: PoolError<DatabaseError>) -> DatabaseError {
    match err {
        PoolError::Backend(e) => e,
        PoolError::Timeout(kind) => {
            DatabaseError::timeout(format!("No SQLite connection became available ({:?})", kind))
                .with_code(codes::POOL_TIMEOUT)
        }
        PoolError::Closed => DatabaseError::connection("SQLite pool is closed").with_code(codes::CONNECTION_LOST),
        PoolError::NoRuntimeSpecified => DatabaseError::config("SQLite pool has no async runtime"),
        PoolError::PostCreateHook(e) => DatabaseError::connection(format!("SQLite pool hook failed: {}", e)),
    }
}

fn open_read_only(path: &str) -> DbResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(sqlite_error)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(sqlite_error)?;
    Ok(conn)
}

fn join_error(err: JoinError) -> DatabaseError {
    DatabaseError::query(format!("SQLite worker failed: {}", err))
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => json!(String::from_utf8_lossy(bytes)),
        ValueRef::Blob(bytes) => json!(format!("0x{}", hex::encode(bytes))),
    }
}

fn run_query(conn: &Connection, sql: &str) -> DbResult<(Vec<String>, Vec<Value>)> {
    let mut stmt = conn.prepare(sql).map_err(sqlite_error)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([]).map_err(sqlite_error)?;
    let mut json_rows = Vec::new();
    while let Some(row) = rows.next().map_err(sqlite_error)? {
        let mut row_obj = serde_json::Map::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(sqlite_error)?;
            row_obj.insert(name.clone(), value_to_json(value));
        }
        json_rows.push(Value::Object(row_obj));
    }

    Ok((columns, json_rows))
}

fn read_schema(conn: &Connection, include_views: bool) -> DbResult<SchemaInfo> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
        )
        .map_err(sqlite_error)?;
    let objects: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(sqlite_error)?
        .collect::<Result<_, _>>()
        .map_err(sqlite_error)?;

    let mut builder = SchemaBuilder::new();
    let mut primary_keys: HashMap<String, Vec<String>> = HashMap::new();
    let mut foreign_keys = Vec::new();

    let mut columns_stmt = conn
        .prepare(r#"SELECT cid, name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#)
        .map_err(sqlite_error)?;
    let mut fk_stmt = conn
        .prepare(r#"SELECT "table", "from", "to" FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#)
        .map_err(sqlite_error)?;

    for (table, kind) in &objects {
        if kind == "view" && !include_views {
            continue;
        }

        let columns: Vec<(i64, String, String, bool, Option<String>, i64)> = columns_stmt
            .query_map([table], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
            })
            .map_err(sqlite_error)?
            .collect::<Result<_, _>>()
            .map_err(sqlite_error)?;

        let pk_count = columns.iter().filter(|c| c.5 > 0).count();
        let mut pks: Vec<(i64, String)> = Vec::new();
        for (cid, name, data_type, not_null, default_value, pk) in columns {
            // A lone INTEGER PRIMARY KEY aliases the rowid
            let auto_increment = pk > 0 && pk_count == 1 && data_type.eq_ignore_ascii_case("integer");
            if pk > 0 {
                pks.push((pk, name.clone()));
                builder.primary_key(CatalogKey {
                    namespace: None,
                    table: table.clone(),
                    column: name.clone(),
                });
            }
            builder.column(CatalogColumn {
                namespace: None,
                table: table.clone(),
                column: name,
                data_type,
                nullable: !not_null && pk == 0,
                default_value,
                auto_increment,
                ordinal: cid,
            });
        }
        pks.sort();
        primary_keys.insert(table.clone(), pks.into_iter().map(|(_, name)| name).collect());

        if kind == "table" {
            let fks: Vec<(String, String, Option<String>)> = fk_stmt
                .query_map([table], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(sqlite_error)?
                .collect::<Result<_, _>>()
                .map_err(sqlite_error)?;
            foreign_keys.extend(fks.into_iter().map(|(target, from, to)| (table.clone(), target, from, to)));
        }
    }

    // `REFERENCES t` without a column list points at t's primary key
    let mut positions: HashMap<(String, String), usize> = HashMap::new();
    for (table, target, from, to) in foreign_keys {
        let ref_column = match to {
            Some(column) => column,
            None => {
                let position = positions.entry((table.clone(), target.clone())).or_insert(0);
                let resolved = primary_keys
                    .get(&target)
                    .and_then(|pks| pks.get(*position))
                    .cloned();
                *position += 1;
                match resolved {
                    Some(column) => column,
                    None => {
                        warn!("Cannot resolve implicit foreign key {}.{} -> {}", table, from, target);
                        continue;
                    }
                }
            }
        };
        builder.foreign_key(CatalogForeignKey {
            namespace: None,
            table,
            column: from,
            ref_namespace: None,
            ref_table: target,
            ref_column,
        });
    }

    Ok(builder.build())
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
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
                let pool = self.build_pool()?;

                // Open the warm connections now so a bad path fails here
                let warm = self.settings.pool_min.clamp(1, self.settings.pool_max.max(1)) as usize;
                let conns = try_join_all((0..warm).map(|_| pool.get()))
                    .await
                    .map_err(map_pool_error)?;
                drop(conns);

                info!(
                    "Opened SQLite pool for {} (max_size: {}, warm: {})",
                    self.settings.database,
                    self.settings.pool_max,
                    pool.status().available
                );
                Ok(pool)
            })
            .await
    }

    async fn close_pool(&self) -> DbResult<()> {
        if let Some(pool) = self.pool.close().await {
            pool.close();
            info!("Closed SQLite pool for {}", self.settings.database);
        }
        Ok(())
    }

    async fn probe(&self) -> DbResult<ServerInfo> {
        let path = self.settings.database.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path)?;
            let version: String = conn
                .query_row("SELECT sqlite_version()", [], |row| row.get(0))
                .map_err(sqlite_error)?;
            // Opening is lazy; touch the schema so a non-database file fails here
            conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
                .map_err(sqlite_error)?;
            Ok(ServerInfo {
                server_version: format!("SQLite {}", version),
                database: path,
            })
        })
        .await
        .map_err(join_error)?
    }

    async fn get_schema(&self, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let pool = self.pool.pool().await?;
        let guard = self.checkout(&pool).await?;
        let include_views = options.include_views;

        let schema = tokio::task::spawn_blocking(move || read_schema(&guard, include_views))
            .await
            .map_err(join_error)??;

        debug!(
            "Loaded SQLite schema: {} tables, {} relationships",
            schema.table_count(),
            schema.relationships.len()
        );
        Ok(schema)
    }

    async fn execute_with_timeout(&self, sql: &str, timeout_secs: u64) -> DbResult<QueryResult> {
        let pool = self.pool.pool().await?;
        let guard = self.checkout(&pool).await?;
        let interrupt = guard.get_interrupt_handle();

        let start_time = Instant::now();
        let sql = sql.to_string();
        // The guard moves into the worker so the connection goes back to
        // the pool when the worker finishes, even after a timeout
        let worker = tokio::task::spawn_blocking(move || run_query(&guard, &sql));

        match tokio::time::timeout(Duration::from_secs(timeout_secs), worker).await {
            Ok(joined) => {
                let (columns, rows) = joined.map_err(join_error)??;
                Ok(QueryResult::new(columns, rows, start_time.elapsed().as_millis() as u64))
            }
            Err(_) => {
                interrupt.interrupt();
                warn!("SQLite query timed out after {}s; interrupted", timeout_secs);
                Err(query_timeout_error(timeout_secs))
            }
        }
    }

    fn enforce_row_limit(&self, sql: &str, max_rows: u64) -> String {
        sql_text::enforce_trailing_limit(&self.sanitize_query(sql), max_rows)
    }

    /// No server-side deadline: the interrupt handle enforces timeouts
    fn timeout_sql(&self, _timeout_secs: u64) -> Option<String> {
        None
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn validate_query(&self, sql: &str) -> DbResult<()> {
        let sql = self.sanitize_query(sql);
        let rules = LexicalRules::for_dialect(self.dialect());
        match check_single_query(&SQLiteDialect {}, &sql)? {
            ParseCheck::Query => Ok(()),
            ParseCheck::Unsupported(reason) if sql_text::is_single_read(&sql, rules) => {
                debug!("sqlparser cannot follow the statement ({}); asking SQLite", reason);
                engine_grammar_check(&sql)
            }
            ParseCheck::Unsupported(reason) => Err(DatabaseError::syntax(format!("SQL parsing error: {}", reason))),
        }
    }

    fn sanitize_query(&self, sql: &str) -> String {
        sql_text::sanitize(sql, LexicalRules::for_dialect(self.dialect()))
    }

    fn map_error(&self, err: BoxError) -> DatabaseError {
        match err.downcast::<rusqlite::Error>() {
            Ok(sqlite) => sqlite_error(*sqlite),
            Err(other) => DatabaseError::classify_message(&other.to_string()).with_source(other),
        }
    }
}

/// Compile the statement against an empty in-memory database. Unknown
/// tables and columns are expected there; only grammar and shape count.
fn engine_grammar_check(sql: &str) -> DbResult<()> {
    let conn = Connection::open_in_memory().map_err(sqlite_error)?;
    let stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(rusqlite::Error::MultipleStatement) => {
            return Err(DatabaseError::syntax("Multiple statements are not allowed"))
        }
        Err(e) => {
            let err = sqlite_error(e);
            if err.is_syntax() && err.code.as_deref() != Some(codes::UNDEFINED_OBJECT) {
                return Err(err);
            }
            return Ok(());
        }
    };

    if stmt.readonly() {
        Ok(())
    } else {
        Err(DatabaseError::syntax("Only SELECT queries are permitted"))
    }
}

fn sqlite_error(err: rusqlite::Error) -> DatabaseError {
    let mapped = match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.clone().unwrap_or_else(|| failure.to_string());
            classify_failure(failure.code, &message).with_native_code(failure.extended_code)
        }
        rusqlite::Error::SqlInputError { error, msg, .. } => {
            classify_failure(error.code, msg).with_native_code(error.extended_code)
        }
        other => DatabaseError::classify_message(&other.to_string()),
    };
    mapped.with_source(err)
}

fn classify_failure(code: ErrorCode, message: &str) -> DatabaseError {
    match code {
        ErrorCode::OperationInterrupted => DatabaseError::timeout(message),
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
            DatabaseError::timeout(message).with_code(codes::TIMED_OUT)
        }
        ErrorCode::CannotOpen | ErrorCode::NotADatabase => {
            DatabaseError::connection(message).with_code(codes::UNKNOWN_DATABASE)
        }
        ErrorCode::PermissionDenied | ErrorCode::ReadOnly | ErrorCode::AuthorizationForStatementDenied => {
            DatabaseError::query(message).with_code(codes::PERMISSION_DENIED)
        }
        _ if message.contains("syntax error") || message.contains("incomplete input") => {
            DatabaseError::syntax(message)
        }
        _ if message.starts_with("no such") => DatabaseError::syntax(message).with_code(codes::UNDEFINED_OBJECT),
        _ => DatabaseError::query(message),
    }
}
