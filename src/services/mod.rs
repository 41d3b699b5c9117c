pub mod connection_pool;
pub mod database; // Dialect adapters, factory and schema normalization
pub mod db_service;
pub mod query_service;
pub mod retry;

pub use connection_pool::*;
pub use db_service::*;
pub use query_service::*;
pub use retry::*;
