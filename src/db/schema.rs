//! Schema definition and version tracking.
//!
//! The schema is a fixed, ordered list of idempotent DDL statements applied
//! on every startup. A `schema_version` table keeps an append-only log of
//! applied versions; the current version is the maximum recorded one.

use crate::config::DatabaseKind;
use crate::db::connection::DbConnection;
use crate::db::params::SqlParam;
use crate::error::{DbError, DbResult};
use tracing::{debug, info};

/// One named DDL statement. The name identifies the statement in errors and
/// logs without repeating the SQL text.
struct SchemaStatement {
    name: &'static str,
    sql: String,
}

const SCHEMA_VERSION: i64 = 1;

/// The table probed by `schema_present`.
const PROBE_TABLE: &str = "tenants";

/// Applies the schema and reads version/presence state over connections
/// supplied by the caller. Stateless apart from the configured backend kind,
/// which selects dialect-specific DDL.
#[derive(Debug, Clone, Copy)]
pub struct SchemaManager {
    kind: DatabaseKind,
}

impl SchemaManager {
    pub fn new(kind: DatabaseKind) -> Self {
        Self { kind }
    }

    /// The ordered statement list. Creation is guarded by existence checks
    /// so re-application across restarts is safe; changes must stay additive
    /// to keep existing databases compatible.
    fn statements(&self) -> Vec<SchemaStatement> {
        // MySQL cannot index unsized TEXT, so identifier columns get a
        // bounded VARCHAR there.
        let id = match self.kind {
            DatabaseKind::MySql => "VARCHAR(64)",
            _ => "TEXT",
        };
        let auto_id = match self.kind {
            DatabaseKind::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            DatabaseKind::MySql => "BIGINT PRIMARY KEY AUTO_INCREMENT",
            DatabaseKind::PostgreSql => "BIGSERIAL PRIMARY KEY",
        };
        vec![
            SchemaStatement {
                name: "tenants",
                sql: format!(
                    "CREATE TABLE IF NOT EXISTS tenants (\
                     tenant_id {id} PRIMARY KEY, \
                     display_name TEXT NOT NULL, \
                     created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
                     active BOOLEAN NOT NULL DEFAULT TRUE)"
                ),
            },
            SchemaStatement {
                name: "tenant_settings",
                sql: format!(
                    "CREATE TABLE IF NOT EXISTS tenant_settings (\
                     tenant_id {id} NOT NULL, \
                     setting_key {id} NOT NULL, \
                     setting_value TEXT, \
                     updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
                     PRIMARY KEY (tenant_id, setting_key))"
                ),
            },
            SchemaStatement {
                name: "sessions",
                sql: format!(
                    "CREATE TABLE IF NOT EXISTS sessions (\
                     session_id {auto_id}, \
                     tenant_id {id} NOT NULL, \
                     started_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
                     ended_at TIMESTAMP)"
                ),
            },
            SchemaStatement {
                name: "audit_log",
                sql: format!(
                    "CREATE TABLE IF NOT EXISTS audit_log (\
                     entry_id {auto_id}, \
                     tenant_id {id}, \
                     action TEXT NOT NULL, \
                     detail TEXT, \
                     created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
                ),
            },
            SchemaStatement {
                name: "schema_version",
                sql: "CREATE TABLE IF NOT EXISTS schema_version (\
                      version INTEGER PRIMARY KEY, \
                      applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
                      description TEXT)"
                    .to_string(),
            },
        ]
    }

    /// Apply every schema statement in order, then record version 1 if no
    /// version row exists yet. The first statement failure aborts the rest
    /// and names the offending statement.
    pub async fn create_schema(&self, conn: &mut DbConnection) -> DbResult<()> {
        for statement in self.statements() {
            debug!(statement = statement.name, "Applying schema statement");
            conn.execute(&statement.sql, &[])
                .await
                .map_err(|e| as_schema_error(statement.name, e))?;
        }
        self.record_initial_version(conn).await?;
        info!(version = SCHEMA_VERSION, "Schema ready");
        Ok(())
    }

    /// Insert the version marker only if absent. An existing row, including
    /// a manually bumped higher version, is left untouched.
    async fn record_initial_version(&self, conn: &mut DbConnection) -> DbResult<()> {
        let sql = match self.kind {
            DatabaseKind::Sqlite => {
                "INSERT OR IGNORE INTO schema_version (version, description) VALUES (?, ?)"
            }
            DatabaseKind::MySql => {
                "INSERT IGNORE INTO schema_version (version, description) VALUES (?, ?)"
            }
            DatabaseKind::PostgreSql => {
                "INSERT INTO schema_version (version, description) VALUES ($1, $2) \
                 ON CONFLICT (version) DO NOTHING"
            }
        };
        conn.execute(
            sql,
            &[
                SqlParam::Int(SCHEMA_VERSION),
                SqlParam::from("Initial schema creation"),
            ],
        )
        .await
        .map_err(|e| as_schema_error("schema_version insert", e))?;
        Ok(())
    }

    /// Highest recorded schema version, or 0 when the tracking table is
    /// empty or does not exist. A missing table is an ordinary answer here,
    /// not an error.
    pub async fn current_version(&self, conn: &mut DbConnection) -> i64 {
        conn.fetch_scalar_i64("SELECT MAX(version) FROM schema_version")
            .await
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// Cheap existence probe on one well-known table. Used by health checks;
    /// never a full integrity verification.
    pub async fn schema_present(&self, conn: &mut DbConnection) -> DbResult<bool> {
        let (sql, params) = match self.kind {
            DatabaseKind::Sqlite => (
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                vec![SqlParam::from(PROBE_TABLE)],
            ),
            DatabaseKind::MySql => (
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?",
                vec![SqlParam::from(PROBE_TABLE)],
            ),
            DatabaseKind::PostgreSql => (
                "SELECT tablename FROM pg_tables \
                 WHERE schemaname = current_schema() AND tablename = $1",
                vec![SqlParam::from(PROBE_TABLE)],
            ),
        };
        let rows = conn.fetch_all(sql, &params).await?;
        Ok(!rows.is_empty())
    }
}

fn as_schema_error(statement: &str, err: DbError) -> DbError {
    match err {
        DbError::Query { source } => DbError::schema(statement, source),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    async fn sqlite_conn(dir: &tempfile::TempDir) -> DbConnection {
        let mut settings = Settings::default();
        settings.database.sqlite.file = dir.path().join("schema.db");
        DbConnection::establish(&settings).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_schema_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;
        let manager = SchemaManager::new(DatabaseKind::Sqlite);

        assert!(!manager.schema_present(&mut conn).await.unwrap());
        assert_eq!(manager.current_version(&mut conn).await, 0);

        manager.create_schema(&mut conn).await.unwrap();
        assert!(manager.schema_present(&mut conn).await.unwrap());
        assert_eq!(manager.current_version(&mut conn).await, 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;
        let manager = SchemaManager::new(DatabaseKind::Sqlite);

        manager.create_schema(&mut conn).await.unwrap();
        manager.create_schema(&mut conn).await.unwrap();

        let rows = conn
            .fetch_all("SELECT version FROM schema_version", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1, "one row per applied version");
        conn.close().await;
    }

    #[tokio::test]
    async fn test_existing_higher_version_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;
        let manager = SchemaManager::new(DatabaseKind::Sqlite);

        manager.create_schema(&mut conn).await.unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, description) VALUES (7, 'manual bump')",
            &[],
        )
        .await
        .unwrap();

        manager.create_schema(&mut conn).await.unwrap();
        assert_eq!(manager.current_version(&mut conn).await, 7);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_statement_failure_names_statement() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;
        let manager = SchemaManager::new(DatabaseKind::Sqlite);

        // An existing index with the table's name makes CREATE TABLE fail
        // even with IF NOT EXISTS.
        conn.execute("CREATE TABLE placeholder (id INTEGER)", &[])
            .await
            .unwrap();
        conn.execute("CREATE INDEX tenants ON placeholder (id)", &[])
            .await
            .unwrap();
        let err = manager.create_schema(&mut conn).await.unwrap_err();
        match err {
            DbError::Schema { statement, .. } => assert_eq!(statement, "tenants"),
            other => panic!("expected schema error, got {other}"),
        }
        conn.close().await;
    }
}
