//! Configuration snapshot for the database access layer.
//!
//! The host application loads its configuration file and deserializes a
//! [`Settings`] value; this crate only consumes the resolved snapshot. All
//! values are immutable after construction; a configuration change requires
//! rebuilding the [`Database`](crate::Database) facade.

use crate::error::{DbError, DbResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// Pool defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_LIFETIME_MS: u64 = 1_800_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 600_000;

// Feature defaults
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;

/// The database backend this layer talks to. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Sqlite,
    MySql,
    #[serde(rename = "postgresql")]
    PostgreSql,
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::MySql => write!(f, "mysql"),
            Self::PostgreSql => write!(f, "postgresql"),
        }
    }
}

impl FromStr for DatabaseKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" => Ok(Self::MySql),
            "postgresql" | "postgres" => Ok(Self::PostgreSql),
            other => Err(DbError::configuration(format!(
                "unsupported database type: {other}"
            ))),
        }
    }
}

/// SQLite-specific connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteSettings {
    /// Database file path, relative to the host's working directory.
    pub file: PathBuf,
    /// Enable write-ahead-log journaling.
    pub wal_mode: bool,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from("database.db"),
            wal_mode: true,
        }
    }
}

/// Network server parameters. Read by both the MySQL and PostgreSQL backends;
/// the section keeps its historical `mysql` name in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    /// Sensitive, never logged.
    pub password: String,
    pub ssl: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            database: "app".to_string(),
            username: "root".to_string(),
            password: String::new(),
            ssl: false,
        }
    }
}

/// Connection pool sizing and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Upper bound on live connections. Must be at least 1.
    pub max_connections: u32,
    /// Connections created eagerly at startup.
    pub min_connections: u32,
    /// How long `acquire` waits for an idle connection before trying to grow
    /// the pool. Must be positive.
    pub connection_timeout_ms: u64,
    /// Connections older than this are recycled at checkout. 0 disables.
    pub max_lifetime_ms: u64,
    /// Retained for the configuration surface; the pool validates on checkout
    /// instead of reaping idle connections in the background.
    pub idle_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            max_lifetime_ms: DEFAULT_MAX_LIFETIME_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

/// Database section of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    pub sqlite: SqliteSettings,
    pub mysql: ServerSettings,
    pub pool: PoolSettings,
}

/// Logging toggles. The host installs the actual `tracing` subscriber; these
/// flags only gate how chatty this crate is.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub debug: bool,
    pub log_queries: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
            log_queries: false,
        }
    }
}

/// Performance toggles for the async dispatcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    /// Run submitted work on a bounded worker set instead of inline.
    pub async_operations: bool,
    /// Worker count override. Defaults to half the available parallelism,
    /// never fewer than 2.
    pub worker_threads: Option<usize>,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            async_operations: true,
            worker_threads: None,
        }
    }
}

/// Feature toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub health_checks: bool,
    pub health_check_interval_secs: u64,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            health_checks: true,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
        }
    }
}

/// Immutable configuration snapshot consumed by every component at
/// construction time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    pub performance: PerformanceSettings,
    pub features: FeatureSettings,
}

impl Settings {
    /// Validate pool sizing and timeouts. Called at facade construction so
    /// misconfiguration fails startup rather than the first acquire.
    pub fn validate(&self) -> DbResult<()> {
        let pool = &self.database.pool;
        if pool.max_connections == 0 {
            return Err(DbError::configuration(
                "database.pool.max_connections must be at least 1",
            ));
        }
        if pool.min_connections > pool.max_connections {
            return Err(DbError::configuration(format!(
                "database.pool.min_connections ({}) cannot exceed max_connections ({})",
                pool.min_connections, pool.max_connections
            )));
        }
        if pool.connection_timeout_ms == 0 {
            return Err(DbError::configuration(
                "database.pool.connection_timeout_ms must be positive",
            ));
        }
        Ok(())
    }

    /// Bounded wait applied to every pool checkout.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.database.pool.connection_timeout_ms)
    }

    /// Maximum connection age before forced recycling. `None` when disabled.
    pub fn max_lifetime(&self) -> Option<Duration> {
        match self.database.pool.max_lifetime_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Period between health monitor probes.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.features.health_check_interval_secs)
    }

    /// Number of dispatcher workers when async operations are enabled.
    pub fn worker_count(&self) -> usize {
        let workers = self.performance.worker_threads.unwrap_or_else(|| {
            let parallelism = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            parallelism / 2
        });
        // Floor applies to explicit overrides too; a zero here would leave
        // the dispatcher with no one to run queued work.
        workers.max(2)
    }
}
