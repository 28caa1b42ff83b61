//! Periodic out-of-band health probing.
//!
//! The monitor holds only a weak reference to the pool: it stops on its own
//! once the pool is dropped, and its failures are logged, never raised,
//! so a transient probe error cannot cascade into caller-visible failures.

use crate::db::pool::ConnectionPool;
use crate::db::schema::SchemaManager;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct HealthMonitor;

impl HealthMonitor {
    /// Spawn the periodic probe task. The returned handle is used only to
    /// cancel the monitor at shutdown.
    pub fn spawn(
        pool: Weak<ConnectionPool>,
        schema: SchemaManager,
        period: Duration,
    ) -> JoinHandle<()> {
        info!(period_secs = period.as_secs(), "Health monitor scheduled");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the startup
            // sequence is not probed while still settling.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    debug!("Pool dropped, health monitor exiting");
                    return;
                };
                run_probe(&pool, schema).await;
            }
        })
    }
}

/// One probe round: health flag, then a single acquire/probe/release round
/// trip. The connection is released on every exit path.
async fn run_probe(pool: &ConnectionPool, schema: SchemaManager) {
    if !pool.is_healthy() {
        warn!(stats = %pool.stats(), "Health check: pool is unhealthy");
        return;
    }
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "Health check could not acquire a connection");
            return;
        }
    };
    match schema.schema_present(&mut conn).await {
        Ok(true) => debug!(stats = %pool.stats(), "Health check passed"),
        Ok(false) => warn!("Health check: schema tables are missing"),
        Err(e) => warn!(error = %e, "Health check schema probe failed"),
    }
    pool.release(conn).await;
}
