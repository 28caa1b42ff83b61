//! Database facade.
//!
//! The one object the host application holds. Construction runs the full
//! startup sequence (pool warm-up, schema application, health monitor,
//! dispatcher); any startup failure aborts construction so the facade is
//! never handed out in a degraded state. The convenience operations collapse
//! failures into a boolean plus a logged cause; callers needing typed errors
//! use `acquire`/`release` directly.

use crate::config::Settings;
use crate::db::connection::is_duplicate_column_error;
use crate::db::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::db::schema::SchemaManager;
use crate::db::types::Row;
use crate::dispatch::{AsyncDispatcher, TaskHandle};
use crate::error::DbResult;
use crate::health::HealthMonitor;
use crate::db::params::SqlParam;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Database {
    pool: Arc<ConnectionPool>,
    schema: SchemaManager,
    dispatcher: AsyncDispatcher,
    health: Mutex<Option<JoinHandle<()>>>,
    log_queries: bool,
}

impl Database {
    /// Run the startup sequence and return a ready facade.
    ///
    /// Order: validate configuration, warm up the pool, apply the schema
    /// over one pooled connection (released on success and failure alike),
    /// then schedule the health monitor and start the dispatcher. Any
    /// failure before that point aborts startup entirely.
    pub async fn connect(settings: Settings) -> DbResult<Self> {
        settings.validate()?;
        let pool = Arc::new(ConnectionPool::new(settings.clone()).await?);
        let schema = SchemaManager::new(settings.database.kind);

        let mut conn = pool.acquire().await?;
        let applied = schema.create_schema(&mut conn).await;
        pool.release(conn).await;
        if let Err(e) = applied {
            pool.shutdown().await;
            return Err(e);
        }

        let health = if settings.features.health_checks {
            Some(HealthMonitor::spawn(
                Arc::downgrade(&pool),
                schema,
                settings.health_check_interval(),
            ))
        } else {
            None
        };
        let dispatcher = AsyncDispatcher::new(&settings);

        info!(backend = %settings.database.kind, "Database layer ready");
        Ok(Self {
            pool,
            schema,
            dispatcher,
            health: Mutex::new(health),
            log_queries: settings.logging.log_queries,
        })
    }

    /// Check a connection out of the pool. The caller must hand it back via
    /// [`Database::release`].
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.pool.acquire().await
    }

    /// Return a checked-out connection.
    pub async fn release(&self, conn: PooledConnection) {
        self.pool.release(conn).await;
    }

    /// Run a write statement with parameters; acquire, execute, and release
    /// in one call. Returns whether the statement succeeded.
    pub async fn execute_update(&self, sql: &str, params: &[SqlParam]) -> bool {
        if sql.trim().is_empty() {
            warn!("Ignoring empty update statement");
            return false;
        }
        if self.log_queries {
            debug!(sql, params = params.len(), "execute_update");
        }
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "execute_update could not acquire a connection");
                return false;
            }
        };
        let result = conn.execute(sql, params).await;
        self.pool.release(conn).await;
        match result {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, sql, "execute_update failed");
                false
            }
        }
    }

    /// Run a read query and hand the decoded rows to `callback`. The
    /// connection is released on every exit path, including a callback
    /// error. Returns whether both the query and the callback succeeded.
    pub async fn execute_query_with<F>(&self, sql: &str, params: &[SqlParam], callback: F) -> bool
    where
        F: FnOnce(&[Row]) -> DbResult<()>,
    {
        if sql.trim().is_empty() {
            warn!("Ignoring empty query");
            return false;
        }
        if self.log_queries {
            debug!(sql, params = params.len(), "execute_query");
        }
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "execute_query could not acquire a connection");
                return false;
            }
        };
        let fetched = conn.fetch_all(sql, params).await;
        self.pool.release(conn).await;
        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, sql, "execute_query failed");
                return false;
            }
        };
        match callback(&rows) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, sql, "query callback failed");
                false
            }
        }
    }

    /// Run one parameterless statement, treating a duplicate-column failure
    /// as success. This keeps additive `ALTER TABLE ... ADD COLUMN`
    /// migrations outside the schema manager idempotent.
    pub async fn execute_statement(&self, sql: &str) -> bool {
        if sql.trim().is_empty() {
            warn!("Ignoring empty statement");
            return false;
        }
        if self.log_queries {
            debug!(sql, "execute_statement");
        }
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "execute_statement could not acquire a connection");
                return false;
            }
        };
        let result = conn.execute(sql, &[]).await;
        self.pool.release(conn).await;
        match result {
            Ok(_) => true,
            Err(e) if is_duplicate_column_error(&e) => {
                debug!(sql, "Column already exists, treating as success");
                true
            }
            Err(e) => {
                error!(error = %e, sql, "execute_statement failed");
                false
            }
        }
    }

    /// Submit work to the async dispatcher.
    pub async fn dispatch<T, F>(&self, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = T> + Send + 'static,
    {
        self.dispatcher.submit(work).await
    }

    /// True while the pool is usable. Cheap enough for per-operation gating.
    pub fn is_available(&self) -> bool {
        self.pool.is_healthy()
    }

    /// Highest applied schema version, 0 when untracked.
    pub async fn schema_version(&self) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        let version = self.schema.current_version(&mut conn).await;
        self.pool.release(conn).await;
        Ok(version)
    }

    /// Point-in-time pool counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Tear everything down: cancel the health monitor, drain the
    /// dispatcher within its grace period, then close the pool. Idempotent.
    pub async fn shutdown(&self) {
        let health = {
            let mut guard = self
                .health
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(handle) = health {
            handle.abort();
        }
        self.dispatcher.shutdown(SHUTDOWN_GRACE).await;
        self.pool.shutdown().await;
        info!("Database layer shut down");
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool", &self.pool.stats())
            .field("log_queries", &self.log_queries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use serde_json::json;

    fn sqlite_settings(dir: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.database.sqlite.file = dir.path().join("facade.db");
        settings.database.pool.min_connections = 1;
        settings.database.pool.max_connections = 2;
        settings.database.pool.connection_timeout_ms = 200;
        settings.features.health_checks = false;
        settings
    }

    #[tokio::test]
    async fn test_connect_applies_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(sqlite_settings(&dir)).await.unwrap();
        assert!(db.is_available());
        assert_eq!(db.schema_version().await.unwrap(), 1);
        db.shutdown().await;
        assert!(!db.is_available());
    }

    #[tokio::test]
    async fn test_update_and_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(sqlite_settings(&dir)).await.unwrap();

        assert!(
            db.execute_update(
                "INSERT INTO tenants (tenant_id, display_name) VALUES (?, ?)",
                &[SqlParam::from("acme"), SqlParam::from("Acme Corp")],
            )
            .await
        );

        let ok = db
            .execute_query_with(
                "SELECT tenant_id, display_name FROM tenants WHERE tenant_id = ?",
                &[SqlParam::from("acme")],
                |rows| {
                    assert_eq!(rows.len(), 1);
                    assert_eq!(rows[0]["display_name"], json!("Acme Corp"));
                    Ok(())
                },
            )
            .await;
        assert!(ok);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_callback_error_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(sqlite_settings(&dir)).await.unwrap();

        let ok = db
            .execute_query_with("SELECT tenant_id FROM tenants", &[], |_| {
                Err(DbError::configuration("rejected by callback"))
            })
            .await;
        assert!(!ok);
        // The connection came back despite the callback failure.
        assert_eq!(db.stats().available, 1);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_statement_duplicate_column_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(sqlite_settings(&dir)).await.unwrap();

        let sql = "ALTER TABLE tenants ADD COLUMN region TEXT";
        assert!(db.execute_statement(sql).await);
        assert!(db.execute_statement(sql).await, "second application also succeeds");
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_sql_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(sqlite_settings(&dir)).await.unwrap();
        assert!(!db.execute_update("   ", &[]).await);
        assert!(!db.execute_statement("").await);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_operations_fail_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(sqlite_settings(&dir)).await.unwrap();
        db.shutdown().await;

        assert!(!db.execute_update("SELECT 1", &[]).await);
        assert!(matches!(db.acquire().await, Err(DbError::Shutdown)));
    }

    #[tokio::test]
    async fn test_dispatch_runs_work() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(sqlite_settings(&dir)).await.unwrap();
        let handle = db.dispatch(async { 7 }).await;
        assert_eq!(handle.join().await.unwrap(), 7);
        db.shutdown().await;
    }
}
