//! Database backends, pooling, and schema management.

pub mod connection;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod schema;
pub mod types;

pub use connection::{DbConnection, connection_url};
pub use params::SqlParam;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use schema::SchemaManager;
pub use types::Row;
