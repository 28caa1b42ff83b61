//! Multi-tenant database access layer.
//!
//! A host application embeds this crate as its single database entry point:
//! a bounded connection pool over SQLite, MySQL, or PostgreSQL, idempotent
//! schema application with version tracking, a periodic health monitor, and
//! an optional async dispatcher for off-thread work. Construct a
//! [`Database`] from a [`Settings`] snapshot and pass it to every consumer;
//! there is no global instance.
//!
//! ```no_run
//! use dblayer::{Database, Settings, SqlParam};
//!
//! # async fn run() -> dblayer::DbResult<()> {
//! let settings: Settings = serde_json::from_str(r#"{
//!     "database": { "type": "sqlite", "sqlite": { "file": "app.db" } }
//! }"#).map_err(|e| dblayer::DbError::configuration(e.to_string()))?;
//!
//! let db = Database::connect(settings).await?;
//! db.execute_update(
//!     "INSERT INTO tenants (tenant_id, display_name) VALUES (?, ?)",
//!     &[SqlParam::from("acme"), SqlParam::from("Acme Corp")],
//! )
//! .await;
//! db.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod health;

pub use config::{DatabaseKind, Settings};
pub use database::Database;
pub use db::{ConnectionPool, DbConnection, PoolStats, PooledConnection, Row, SchemaManager, SqlParam};
pub use dispatch::{AsyncDispatcher, Canceled, TaskHandle};
pub use error::{DbError, DbResult};
pub use health::HealthMonitor;
