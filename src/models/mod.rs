pub mod connection;
pub mod error;
pub mod metadata;
pub mod query;

pub use connection::*;
pub use error::*;
pub use metadata::*;
pub use query::*;
