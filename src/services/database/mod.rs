// Database abstraction layer for multi-database support
pub mod adapter;
pub mod factory;
pub mod mysql;
pub mod postgresql;
pub mod schema;
pub mod sqlite;
pub mod sqlserver;

pub use adapter::{AdapterState, DatabaseAdapter, PoolSlot, DEFAULT_QUERY_TIMEOUT_SECS};
pub use factory::{AdapterFactory, DefaultAdapterFactory};
pub use mysql::MySqlAdapter;
pub use postgresql::PostgresAdapter;
pub use schema::SchemaBuilder;
pub use sqlite::SqliteAdapter;
pub use sqlserver::SqlServerAdapter;
