//! Bounded connection pool.
//!
//! The pool owns every connection's lifecycle: warm-up, checkout with a hard
//! wait bound, validation on checkout, forced recycling past `max_lifetime`,
//! and idempotent shutdown. No global lock serializes the pool: the idle
//! set has its own mutex (never held across an await), while `active` and
//! `shut_down` are plain atomics.

use crate::config::Settings;
use crate::db::connection::{DbConnection, connection_url};
use crate::error::{DbError, DbResult};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// A connection checked out of the pool, tagged with its creation time so
/// the pool can force-recycle it once `max_lifetime` has elapsed.
#[derive(Debug)]
pub struct PooledConnection {
    conn: DbConnection,
    created_at: Instant,
}

impl PooledConnection {
    fn new(conn: DbConnection) -> Self {
        Self {
            conn,
            created_at: Instant::now(),
        }
    }

    /// How long ago this connection was established.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

impl Deref for PooledConnection {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut DbConnection {
        &mut self.conn
    }
}

/// Point-in-time pool snapshot for diagnostics. Best effort: not
/// transactionally consistent with concurrent acquire/release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections created and not yet permanently closed.
    pub active: u32,
    /// Connections sitting in the idle set.
    pub available: u32,
    /// Configured upper bound.
    pub max: u32,
    pub shut_down: bool,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConnectionPool[active={}, available={}, max={}, shutdown={}]",
            self.active, self.available, self.max, self.shut_down
        )
    }
}

/// Bounded pool of exclusively-checked-out connections.
///
/// Invariants: `active <= max_connections` at all times; a connection is
/// held by exactly one of the idle set or one in-flight caller; once
/// `shut_down` flips to true it never reverts and every acquire fails fast.
pub struct ConnectionPool {
    settings: Settings,
    idle: Mutex<VecDeque<PooledConnection>>,
    active: AtomicU32,
    shut_down: AtomicBool,
    /// Signalled once per release back to the idle set.
    released: Notify,
}

impl ConnectionPool {
    /// Construct the pool and warm it up to `min_connections`.
    ///
    /// The connection URL is built eagerly so misconfiguration surfaces here
    /// rather than on first use. A warm-up connection failure is fatal: the
    /// already-opened connections are closed and the error is returned.
    pub async fn new(settings: Settings) -> DbResult<Self> {
        settings.validate()?;
        let url = connection_url(&settings)?;
        debug!(backend = %settings.database.kind, "Initializing connection pool");

        let pool = Self {
            idle: Mutex::new(VecDeque::with_capacity(
                settings.database.pool.max_connections as usize,
            )),
            active: AtomicU32::new(0),
            shut_down: AtomicBool::new(false),
            released: Notify::new(),
            settings,
        };

        for _ in 0..pool.settings.database.pool.min_connections {
            match DbConnection::establish(&pool.settings).await {
                Ok(conn) => {
                    pool.active.fetch_add(1, Ordering::AcqRel);
                    pool.lock_idle().push_back(PooledConnection::new(conn));
                }
                Err(e) => {
                    let opened: Vec<_> = pool.lock_idle().drain(..).collect();
                    for conn in opened {
                        conn.conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            backend = %pool.settings.database.kind,
            url = %redact_url(&url),
            min = pool.settings.database.pool.min_connections,
            max = pool.settings.database.pool.max_connections,
            "Connection pool ready"
        );
        Ok(pool)
    }

    /// Check out a connection.
    ///
    /// Waits up to the configured acquire timeout for an idle connection,
    /// validating each candidate and discarding dead ones without resetting
    /// the consumed budget. When the wait budget runs out, creates a new
    /// connection if under capacity, otherwise fails with
    /// [`DbError::PoolExhausted`].
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let deadline = Instant::now() + self.settings.acquire_timeout();
        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(DbError::Shutdown);
            }

            // Bind before matching so the idle guard drops ahead of the
            // validation await.
            let candidate = self.lock_idle().pop_front();
            if let Some(conn) = candidate {
                match self.validate(conn).await {
                    Some(conn) => return Ok(conn),
                    // Dead or past lifetime: discarded, keep the remaining
                    // wait budget and try the next candidate.
                    None => continue,
                }
            }

            // Register interest before re-checking emptiness so a release
            // racing with us cannot be missed.
            let released = self.released.notified();
            if !self.lock_idle().is_empty() {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, released).await.is_err()
            {
                return self.create_or_exhausted().await;
            }
        }
    }

    /// The timed-out branch of `acquire`: open a fresh connection if a slot
    /// is free, otherwise report exhaustion.
    async fn create_or_exhausted(&self) -> DbResult<PooledConnection> {
        let max = self.settings.database.pool.max_connections;
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= max {
                warn!(max, "Connection pool exhausted");
                return Err(DbError::PoolExhausted { max });
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // Slot reserved. A shutdown that began meanwhile must not gain a
        // new connection.
        if self.shut_down.load(Ordering::Acquire) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(DbError::Shutdown);
        }
        match DbConnection::establish(&self.settings).await {
            Ok(conn) => {
                debug!(
                    active = self.active.load(Ordering::Acquire),
                    "Created new pooled connection"
                );
                Ok(PooledConnection::new(conn))
            }
            Err(e) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Validate a checkout candidate. Returns `None` after discarding a
    /// connection that outlived `max_lifetime` or fails the liveness probe.
    async fn validate(&self, mut conn: PooledConnection) -> Option<PooledConnection> {
        if let Some(lifetime) = self.settings.max_lifetime() {
            if conn.age() >= lifetime {
                debug!(age_secs = conn.age().as_secs(), "Recycling aged connection");
                self.discard(conn).await;
                return None;
            }
        }
        match conn.conn.ping().await {
            Ok(()) => Some(conn),
            Err(e) => {
                warn!(error = %e, "Discarding dead idle connection");
                self.discard(conn).await;
                None
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// After shutdown the connection is closed instead of pooled. A failed
    /// transactional reset invalidates the connection. Never blocks on pool
    /// capacity: a surplus connection is closed, not queued.
    pub async fn release(&self, mut conn: PooledConnection) {
        if self.shut_down.load(Ordering::Acquire) {
            self.discard(conn).await;
            return;
        }
        if let Err(e) = conn.conn.reset().await {
            warn!(error = %e, "Reset failed on release, closing connection");
            self.discard(conn).await;
            return;
        }
        let surplus = {
            let mut idle = self.lock_idle();
            // Re-checked under the lock: a shutdown drain that already ran
            // must not be followed by a late push.
            if self.shut_down.load(Ordering::Acquire)
                || idle.len() >= self.settings.database.pool.max_connections as usize
            {
                Some(conn)
            } else {
                idle.push_back(conn);
                None
            }
        };
        match surplus {
            Some(conn) => self.discard(conn).await,
            None => self.released.notify_one(),
        }
    }

    /// Close a connection and give up its slot.
    async fn discard(&self, conn: PooledConnection) {
        conn.conn.close().await;
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Close every idle connection and refuse all further checkouts.
    /// Idempotent: only the first caller performs the drain. Checked-out
    /// connections are closed when their holders release them.
    pub async fn shutdown(&self) {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("Shutting down connection pool");
        // Blocked acquirers wake and fail fast with ShutdownError.
        self.released.notify_waiters();
        let drained: Vec<_> = self.lock_idle().drain(..).collect();
        let closed = drained.len();
        for conn in drained {
            self.discard(conn).await;
        }
        info!(closed, "Connection pool shut down");
    }

    /// True iff the pool is usable: not shut down and at least one
    /// connection exists. Non-blocking.
    pub fn is_healthy(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire) && self.active.load(Ordering::Acquire) > 0
    }

    /// Best-effort snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Acquire),
            available: self.lock_idle().len() as u32,
            max: self.settings.database.pool.max_connections,
            shut_down: self.shut_down.load(Ordering::Acquire),
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<PooledConnection>> {
        // A poisoned idle set only means a panic elsewhere; the deque
        // itself is still structurally sound.
        self.idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.stats().fmt(f)
    }
}

/// Strip the password from a DSN before it reaches a log line.
fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pool_settings(dir: &TempDir, min: u32, max: u32, timeout_ms: u64) -> Settings {
        let mut settings = Settings::default();
        settings.database.sqlite.file = dir.path().join("pool.db");
        settings.database.pool.min_connections = min;
        settings.database.pool.max_connections = max;
        settings.database.pool.connection_timeout_ms = timeout_ms;
        settings
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("mysql://svc:secret@db:3306/app"),
            "mysql://svc:****@db:3306/app"
        );
        assert_eq!(redact_url("sqlite://app.db"), "sqlite://app.db");
    }

    #[tokio::test]
    async fn test_prewarm_reaches_min_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_settings(&dir, 2, 4, 100)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.max, 4);
        assert!(!stats.shut_down);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_reuses_then_creates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_settings(&dir, 2, 4, 100)).await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.active, stats.available), (2, 0));

        // Third checkout exceeds the warm set: waits out the budget, then
        // creates a new connection.
        let c = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.active, stats.available), (3, 0));

        pool.release(a).await;
        pool.release(b).await;
        pool.release(c).await;
        assert_eq!(pool.stats().available, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_settings(&dir, 0, 1, 100)).await.unwrap();
        let held = pool.acquire().await.unwrap();

        let start = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { max: 1 }));
        assert!(start.elapsed() >= Duration::from_millis(90));

        pool.release(held).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_acquire_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(
            ConnectionPool::new(pool_settings(&dir, 2, 4, 100)).await.unwrap(),
        );
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let _c = pool.acquire().await.unwrap();

        // Fourth and fifth race for the single remaining slot.
        let (fourth, fifth) = tokio::join!(pool.acquire(), pool.acquire());
        let succeeded = [fourth.is_ok(), fifth.is_ok()];
        assert_eq!(succeeded.iter().filter(|ok| **ok).count(), 1);
        let err = match (fourth, fifth) {
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => e,
            _ => unreachable!(),
        };
        assert!(matches!(err, DbError::PoolExhausted { max: 4 }));
        assert_eq!(pool.stats().active, 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_runs_on_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(
            ConnectionPool::new(pool_settings(&dir, 1, 2, 200)).await.unwrap(),
        );
        // Checkout of a warm connection (the validating path) must work from
        // a spawned task, which requires the acquire future to be Send.
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        let conn = task.await.unwrap().unwrap();
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiter_picks_up_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(
            ConnectionPool::new(pool_settings(&dir, 0, 1, 500)).await.unwrap(),
        );
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held).await;

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(pool.stats().active, 1);
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_settings(&dir, 2, 4, 5_000)).await.unwrap();
        pool.shutdown().await;

        let start = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::Shutdown));
        // No waiting on a dead pool, even with a long configured timeout.
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!pool.is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_settings(&dir, 2, 4, 100)).await.unwrap();
        pool.shutdown().await;
        pool.shutdown().await;
        let stats = pool.stats();
        assert_eq!((stats.active, stats.available), (0, 0));
        assert!(stats.shut_down);
    }

    #[tokio::test]
    async fn test_release_after_shutdown_closes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_settings(&dir, 1, 4, 100)).await.unwrap();
        let held = pool.acquire().await.unwrap();
        pool.shutdown().await;
        assert_eq!(pool.stats().active, 1);

        pool.release(held).await;
        let stats = pool.stats();
        assert_eq!((stats.active, stats.available), (0, 0));
    }

    #[tokio::test]
    async fn test_aged_connection_is_recycled() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = pool_settings(&dir, 1, 2, 100);
        settings.database.pool.max_lifetime_ms = 1;
        let pool = ConnectionPool::new(settings).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        // The warm connection is past its lifetime; acquire must discard it
        // and hand out a fresh one instead.
        let conn = pool.acquire().await.unwrap();
        assert!(conn.age() < Duration::from_millis(100));
        assert_eq!(pool.stats().active, 1);
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_is_healthy_requires_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_settings(&dir, 0, 2, 100)).await.unwrap();
        assert!(!pool.is_healthy());

        let conn = pool.acquire().await.unwrap();
        assert!(pool.is_healthy());
        pool.release(conn).await;
        pool.shutdown().await;
        assert!(!pool.is_healthy());
    }
}
