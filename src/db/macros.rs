//! Backend dispatch macro.
//!
//! Most connection operations differ only in which sqlx driver types they
//! touch. This macro generates the match over [`DbConnection`] variants so
//! call sites stay linear and readable.

/// Generate match arms over `DbConnection` variants.
///
/// # Example
///
/// ```ignore
/// dispatch_connection!(conn, {
///     Sqlite(c) => do_sqlite(c),
///     MySql(c) => do_mysql(c),
///     Postgres(c) => do_postgres(c),
/// });
/// ```
#[macro_export]
macro_rules! dispatch_connection {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::connection::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use dispatch_connection;
