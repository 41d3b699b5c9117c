// PostgreSQL adapter using deadpool-postgres connection pooling
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_postgres::{Config as PgPoolConfig, ManagerConfig, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use sqlparser::dialect::PostgreSqlDialect;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, NoTls, Row, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info, warn};

use super::adapter::{parse_single_query, query_timeout_error, AdapterState, DatabaseAdapter, PoolSlot};
use super::schema::{CatalogColumn, CatalogForeignKey, CatalogKey, SchemaBuilder};
use crate::models::{
    codes, BoxError, ConnectionSettings, DatabaseError, DbResult, Dialect, QueryResult, SchemaInfo,
    SchemaOptions, ServerInfo,
};
use crate::validation::sql_text::{self, LexicalRules};

/// Server-side guard: every transaction on these sessions starts read-only
const READ_ONLY_SESSION_OPTIONS: &str = "-c default_transaction_read_only=on";

const COLUMNS_SQL: &str = r#"
    SELECT
        c.table_schema::text,
        c.table_name::text,
        c.column_name::text,
        c.data_type::text,
        c.is_nullable = 'YES' AS nullable,
        c.column_default::text,
        COALESCE(c.column_default LIKE 'nextval(%' OR c.is_identity = 'YES', false) AS auto_increment,
        c.ordinal_position::int8
    FROM information_schema.columns c
    JOIN information_schema.tables t
        ON t.table_schema = c.table_schema AND t.table_name = c.table_name
    WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
        AND c.table_schema NOT LIKE 'pg\_toast%'
        AND c.table_schema NOT LIKE 'pg\_temp%'
        AND (t.table_type = 'BASE TABLE' OR ($1 AND t.table_type = 'VIEW'))
        AND (cardinality($2::text[]) = 0 OR c.table_schema = ANY($2::text[]))
    ORDER BY c.table_schema, c.table_name, c.ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT tc.table_schema::text, tc.table_name::text, kcu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.constraint_schema = kcu.constraint_schema
        AND tc.table_name = kcu.table_name
    WHERE tc.constraint_type = 'PRIMARY KEY'
"#;

// information_schema cannot resolve the referenced column of a composite
// key reliably, so foreign keys come straight from pg_constraint
const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        ns.nspname::text, cl.relname::text, att.attname::text,
        fns.nspname::text, fcl.relname::text, fatt.attname::text
    FROM pg_constraint con
    JOIN pg_class cl ON cl.oid = con.conrelid
    JOIN pg_namespace ns ON ns.oid = cl.relnamespace
    JOIN pg_class fcl ON fcl.oid = con.confrelid
    JOIN pg_namespace fns ON fns.oid = fcl.relnamespace
    CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(attnum, fattnum)
    JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum
    JOIN pg_attribute fatt ON fatt.attrelid = con.confrelid AND fatt.attnum = k.fattnum
    WHERE con.contype = 'f'
"#;

pub struct PostgresAdapter {
    settings: ConnectionSettings,
    pool: PoolSlot<Pool>,
}

impl PostgresAdapter {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            pool: PoolSlot::new(),
        }
    }

    fn tls_connector(&self) -> DbResult<MakeRustlsConnect> {
        if self.settings.ssl.trust_server_certificate {
            warn!("trust_server_certificate is ignored for PostgreSQL; certificates are always verified");
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| {
                DatabaseError::config(format!("Failed to build TLS configuration: {}", e))
                    .with_code(codes::TLS_FAILED)
            })?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(MakeRustlsConnect::new(tls_config))
    }

    fn pool_config(&self) -> PgPoolConfig {
        let s = &self.settings;
        let mut cfg = PgPoolConfig::new();
        cfg.host = Some(s.host.clone());
        cfg.port = Some(s.port);
        cfg.dbname = Some(s.database.clone());
        cfg.user = Some(s.username.clone());
        cfg.password = Some(s.password.clone());
        cfg.connect_timeout = Some(s.connect_timeout);
        cfg.application_name = Some(env!("CARGO_PKG_NAME").to_string());
        cfg.options = Some(READ_ONLY_SESSION_OPTIONS.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool = PoolConfig::new(s.pool_max as usize);
        pool.timeouts.wait = Some(s.connect_timeout);
        pool.timeouts.create = Some(s.connect_timeout);
        pool.timeouts.recycle = Some(s.connect_timeout);
        cfg.pool = Some(pool);
        cfg
    }

    fn build_pool(&self) -> DbResult<Pool> {
        let cfg = self.pool_config();
        let created = if self.settings.ssl.enabled {
            cfg.create_pool(Some(Runtime::Tokio1), self.tls_connector()?)
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        };

        created.map_err(|e| DatabaseError::config(format!("Failed to create connection pool: {}", e)))
    }

    fn client_config(&self) -> tokio_postgres::Config {
        let s = &self.settings;
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&s.host)
            .port(s.port)
            .dbname(&s.database)
            .user(&s.username)
            .password(&s.password)
            .options(READ_ONLY_SESSION_OPTIONS)
            .connect_timeout(s.connect_timeout);
        cfg
    }

    /// Cancel whatever the pooled session is running. Best effort.
    async fn cancel_running(&self, token: tokio_postgres::CancelToken) {
        let cancelled = if self.settings.ssl.enabled {
            match self.tls_connector() {
                Ok(tls) => token.cancel_query(tls).await,
                Err(_) => return,
            }
        } else {
            token.cancel_query(NoTls).await
        };

        if let Err(e) = cancelled {
            debug!("Failed to cancel timed out PostgreSQL query: {}", e);
        }
    }

    async fn load_schema(client: &Client, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let mut builder = SchemaBuilder::new().with_namespaces(&options.namespaces);

        let rows = client
            .query(COLUMNS_SQL, &[&options.include_views, &options.namespaces])
            .await
            .map_err(pg_error)?;
        for row in &rows {
            builder.column(CatalogColumn {
                namespace: Some(row.try_get(0).map_err(pg_error)?),
                table: row.try_get(1).map_err(pg_error)?,
                column: row.try_get(2).map_err(pg_error)?,
                data_type: row.try_get(3).map_err(pg_error)?,
                nullable: row.try_get(4).map_err(pg_error)?,
                default_value: row.try_get(5).map_err(pg_error)?,
                auto_increment: row.try_get(6).map_err(pg_error)?,
                ordinal: row.try_get(7).map_err(pg_error)?,
            });
        }

        for row in client.query(PRIMARY_KEYS_SQL, &[]).await.map_err(pg_error)? {
            builder.primary_key(CatalogKey {
                namespace: Some(row.try_get(0).map_err(pg_error)?),
                table: row.try_get(1).map_err(pg_error)?,
                column: row.try_get(2).map_err(pg_error)?,
            });
        }

        for row in client.query(FOREIGN_KEYS_SQL, &[]).await.map_err(pg_error)? {
            builder.foreign_key(CatalogForeignKey {
                namespace: Some(row.try_get(0).map_err(pg_error)?),
                table: row.try_get(1).map_err(pg_error)?,
                column: row.try_get(2).map_err(pg_error)?,
                ref_namespace: Some(row.try_get(3).map_err(pg_error)?),
                ref_table: row.try_get(4).map_err(pg_error)?,
                ref_column: row.try_get(5).map_err(pg_error)?,
            });
        }

        Ok(builder.build())
    }
}

/// Open one unpooled client and drive its connection on a background task
async fn connect_client<T>(config: &tokio_postgres::Config, tls: T) -> Result<Client, tokio_postgres::Error>
where
    T: MakeTlsConnect<Socket> + Send + 'static,
    T::Stream: Send + 'static,
    T::TlsConnect: Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let (client, connection) = config.connect(tls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL probe connection error: {}", e);
        }
    });
    Ok(client)
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSql
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

                // Fail fast on bad credentials and warm up the minimum
                let warm = self.settings.pool_min.max(1) as usize;
                let clients = try_join_all((0..warm).map(|_| pool.get()))
                    .await
                    .map_err(map_pool_error)?;
                drop(clients);

                info!(
                    "Created PostgreSQL pool for {}/{} (max_size: {}, warm: {})",
                    self.settings.address(),
                    self.settings.database,
                    self.settings.pool_max,
                    warm
                );
                Ok(pool)
            })
            .await
    }

    async fn close_pool(&self) -> DbResult<()> {
        if let Some(pool) = self.pool.close().await {
            pool.close();
            info!(
                "Closed PostgreSQL pool for {}/{}",
                self.settings.address(),
                self.settings.database
            );
        }
        Ok(())
    }

    async fn probe(&self) -> DbResult<ServerInfo> {
        let config = self.client_config();
        let connected = if self.settings.ssl.enabled {
            connect_client(&config, self.tls_connector()?).await
        } else {
            connect_client(&config, NoTls).await
        };
        let client = connected.map_err(pg_error)?;

        let row = client
            .query_one("SELECT version(), current_database()::text", &[])
            .await
            .map_err(pg_error)?;

        Ok(ServerInfo {
            server_version: row.try_get(0).map_err(pg_error)?,
            database: row.try_get(1).map_err(pg_error)?,
        })
    }

    async fn get_schema(&self, options: &SchemaOptions) -> DbResult<SchemaInfo> {
        let pool = self.pool.pool().await?;
        let client = pool.get().await.map_err(map_pool_error)?;
        let schema = Self::load_schema(&client, options).await?;

        debug!(
            "Loaded PostgreSQL schema: {} tables, {} relationships",
            schema.table_count(),
            schema.relationships.len()
        );
        Ok(schema)
    }

    async fn execute_with_timeout(&self, sql: &str, timeout_secs: u64) -> DbResult<QueryResult> {
        let pool = self.pool.pool().await?;
        let client = pool.get().await.map_err(map_pool_error)?;

        if let Some(statement) = self.timeout_sql(timeout_secs) {
            client.batch_execute(&statement).await.map_err(pg_error)?;
        }

        let start_time = Instant::now();
        let cancel_token = client.cancel_token();
        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), client.query(sql, &[])).await;

        let rows = match outcome {
            Ok(result) => {
                // The session goes back to the pool; clear its deadline
                if let Err(e) = client.batch_execute("RESET statement_timeout").await {
                    warn!("Discarding PostgreSQL connection after failed reset: {}", e);
                    let _ = deadpool_postgres::Object::take(client);
                }
                result.map_err(pg_error)?
            }
            Err(_) => {
                self.cancel_running(cancel_token).await;
                let _ = deadpool_postgres::Object::take(client);
                warn!("PostgreSQL query timed out after {}s; connection discarded", timeout_secs);
                return Err(query_timeout_error(timeout_secs));
            }
        };

        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => Vec::new(),
        };
        let json_rows = rows.iter().map(row_to_json).collect();

        Ok(QueryResult::new(columns, json_rows, start_time.elapsed().as_millis() as u64))
    }

    fn enforce_row_limit(&self, sql: &str, max_rows: u64) -> String {
        sql_text::enforce_trailing_limit(&self.sanitize_query(sql), max_rows)
    }

    fn timeout_sql(&self, timeout_secs: u64) -> Option<String> {
        Some(format!("SET statement_timeout = {}", timeout_secs.saturating_mul(1000)))
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn validate_query(&self, sql: &str) -> DbResult<()> {
        parse_single_query(&PostgreSqlDialect {}, LexicalRules::for_dialect(self.dialect()), &self.sanitize_query(sql))
    }

    fn sanitize_query(&self, sql: &str) -> String {
        sql_text::sanitize(sql, LexicalRules::for_dialect(self.dialect()))
    }

    fn map_error(&self, err: BoxError) -> DatabaseError {
        let err = match err.downcast::<tokio_postgres::Error>() {
            Ok(pg) => return pg_error(*pg),
            Err(other) => other,
        };
        let err = match err.downcast::<PoolError>() {
            Ok(pool) => return map_pool_error(*pool),
            Err(other) => other,
        };
        match err.downcast::<std::io::Error>() {
            Ok(io) => DatabaseError::from_io(&io).with_source(*io),
            Err(other) => DatabaseError::classify_message(&other.to_string()).with_source(other),
        }
    }
}

fn pg_error(err: tokio_postgres::Error) -> DatabaseError {
    let mapped = if let Some(db) = err.as_db_error() {
        classify_sqlstate(db.code().code(), db.message())
    } else if err.is_closed() {
        DatabaseError::connection(err.to_string()).with_code(codes::CONNECTION_LOST)
    } else if let Some(io) = err.source().and_then(|s| s.downcast_ref::<std::io::Error>()) {
        DatabaseError::from_io(io)
    } else {
        DatabaseError::classify_message(&err.to_string())
    };
    mapped.with_source(err)
}

/// SQLSTATE classes: 08 connection, 28 auth, 42 syntax/access, 57 operator
/// intervention
fn classify_sqlstate(state: &str, message: &str) -> DatabaseError {
    let mapped = match state {
        "3D000" => DatabaseError::connection(message).with_code(codes::UNKNOWN_DATABASE),
        "57014" => DatabaseError::timeout(message),
        "57P01" | "57P02" | "57P03" | "53300" => {
            DatabaseError::connection(message).with_code(codes::CONNECTION_LOST)
        }
        "42501" => DatabaseError::query(message).with_code(codes::PERMISSION_DENIED),
        "42P01" | "42703" | "42883" => DatabaseError::syntax(message).with_code(codes::UNDEFINED_OBJECT),
        s if s.starts_with("08") => DatabaseError::connection(message).with_code(codes::CONNECTION_LOST),
        s if s.starts_with("28") => DatabaseError::connection(message).with_code(codes::AUTH_FAILED),
        s if s.starts_with("42") => DatabaseError::syntax(message),
        _ => DatabaseError::query(message),
    };
    mapped.with_native_code(state)
}

fn map_pool_error(err: PoolError) -> DatabaseError {
    match err {
        PoolError::Backend(e) => pg_error(e),
        PoolError::Timeout(kind) => {
            DatabaseError::timeout(format!("Timed out waiting for a pooled connection ({:?})", kind))
                .with_code(codes::POOL_TIMEOUT)
        }
        PoolError::Closed => {
            DatabaseError::connection("Connection pool is closed").with_code(codes::CONNECTION_LOST)
        }
        other => DatabaseError::connection(format!("Connection pool error: {}", other)),
    }
}

/// Binary NUMERIC decoded to its exact decimal text
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("truncated NUMERIC value".into());
    }
    let word = |i: usize| i16::from_be_bytes([raw[i], raw[i + 1]]);

    let ndigits = word(0).max(0) as usize;
    let weight = word(2) as i32;
    let sign = word(4) as u16;
    let dscale = word(6).max(0) as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("truncated NUMERIC digits".into());
    }
    let digit = |group: i32| -> i16 {
        if group >= 0 && (group as usize) < ndigits {
            word(8 + group as usize * 2)
        } else {
            0
        }
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for group in 0..=weight {
            if group == 0 {
                text.push_str(&digit(group).to_string());
            } else {
                text.push_str(&format!("{:04}", digit(group)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut group = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(group)));
            group += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}

fn typed<'a, T>(row: &'a Row, idx: usize) -> Value
where
    T: FromSql<'a> + Serialize,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => serde_json::to_value(v).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn row_to_json(row: &Row) -> Value {
    let mut row_obj = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => typed::<bool>(row, idx),
            Type::INT2 => typed::<i16>(row, idx),
            Type::INT4 => typed::<i32>(row, idx),
            Type::INT8 => typed::<i64>(row, idx),
            Type::OID => typed::<u32>(row, idx),
            Type::FLOAT4 => typed::<f32>(row, idx),
            Type::FLOAT8 => typed::<f64>(row, idx),
            Type::NUMERIC => match row.try_get::<_, Option<PgNumeric>>(idx) {
                Ok(Some(n)) => Value::String(n.0),
                _ => Value::Null,
            },
            Type::JSON | Type::JSONB => typed::<Value>(row, idx),
            Type::UUID => typed::<uuid::Uuid>(row, idx),
            Type::TIMESTAMP => typed::<chrono::NaiveDateTime>(row, idx),
            Type::TIMESTAMPTZ => typed::<chrono::DateTime<chrono::Utc>>(row, idx),
            Type::DATE => typed::<chrono::NaiveDate>(row, idx),
            Type::TIME => typed::<chrono::NaiveTime>(row, idx),
            Type::BYTEA => match row.try_get::<_, Option<Vec<u8>>>(idx) {
                Ok(Some(bytes)) => Value::String(format!("\\x{}", hex::encode(bytes))),
                _ => Value::Null,
            },
            _ => match row.try_get::<_, Option<String>>(idx) {
                Ok(Some(v)) => Value::String(v),
                Ok(None) => Value::Null,
                // Types with no text decoding show their type name
                Err(_) => Value::String(format!("<{}>", column.type_().name())),
            },
        };
        row_obj.insert(column.name().to_string(), value);
    }
    Value::Object(row_obj)
}
