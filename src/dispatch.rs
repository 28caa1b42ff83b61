//! Bounded async task dispatch.
//!
//! Callers hand the dispatcher futures to run off their own task. When async
//! execution is enabled the work goes to a fixed worker set sized from
//! available parallelism; when disabled, `submit` runs the work inline and
//! returns an already-resolved handle. Workers never block process shutdown
//! indefinitely: `shutdown` grants a bounded grace period, then aborts.

use crate::config::Settings;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The submitted work was dropped before completing, typically because the
/// dispatcher was shut down first.
#[derive(Debug, thiserror::Error)]
#[error("task was canceled before completion")]
pub struct Canceled;

/// Handle to one submitted unit of work.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task's result. For inline execution the result is
    /// already buffered and this resolves immediately.
    pub async fn join(self) -> Result<T, Canceled> {
        self.rx.await.map_err(|_| Canceled)
    }
}

enum Mode {
    Inline,
    Workers {
        queue: mpsc::Sender<BoxFuture<'static, ()>>,
        handles: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// Runs caller-supplied futures either inline or on a bounded worker set.
pub struct AsyncDispatcher {
    mode: Mutex<Mode>,
}

impl AsyncDispatcher {
    /// Build the dispatcher per the configuration snapshot. With async
    /// operations disabled no workers are spawned at all.
    pub fn new(settings: &Settings) -> Self {
        if !settings.performance.async_operations {
            debug!("Async operations disabled, work will run inline");
            return Self {
                mode: Mutex::new(Mode::Inline),
            };
        }

        let workers = settings.worker_count();
        let (tx, rx) = mpsc::channel::<BoxFuture<'static, ()>>(workers * 4);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // Lock only to receive; the work itself runs
                        // unlocked so workers stay independent.
                        let task = rx.lock().await.recv().await;
                        match task {
                            Some(task) => task.await,
                            None => break,
                        }
                    }
                    debug!(worker = id, "Dispatch worker exiting");
                })
            })
            .collect();
        info!(workers, "Async dispatcher started");
        Self {
            mode: Mutex::new(Mode::Workers { queue: tx, handles }),
        }
    }

    /// Submit a unit of work.
    ///
    /// With workers enabled the future is queued and the handle resolves
    /// when a worker finishes it. With inline mode the work runs to
    /// completion here, before `submit` returns. After shutdown the work is
    /// dropped and the handle resolves as canceled.
    pub async fn submit<T, F>(&self, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        // Snapshot the route and release the mode lock before any await, so
        // submitted work may itself submit follow-up work.
        let queue = {
            let mode = self.mode.lock().await;
            match &*mode {
                Mode::Inline => None,
                Mode::Workers { queue, .. } => Some(queue.clone()),
                Mode::Stopped => {
                    warn!("Task submitted after dispatcher shutdown");
                    return TaskHandle { rx };
                }
            }
        };
        match queue {
            None => {
                // Receiver is held, send cannot fail.
                let _ = tx.send(work.await);
            }
            Some(queue) => {
                let task: BoxFuture<'static, ()> = Box::pin(async move {
                    let _ = tx.send(work.await);
                });
                if queue.send(task).await.is_err() {
                    warn!("Task submitted after dispatcher shutdown");
                }
            }
        }
        TaskHandle { rx }
    }

    /// Stop accepting work, then give in-flight tasks the grace period to
    /// finish before aborting them. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        let previous = {
            let mut mode = self.mode.lock().await;
            std::mem::replace(&mut *mode, Mode::Stopped)
        };
        let Mode::Workers { queue, handles } = previous else {
            return;
        };
        info!(grace_secs = grace.as_secs(), "Draining async dispatcher");
        // Dropping the sender lets workers drain the channel and exit.
        drop(queue);
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Dispatch worker did not drain in time, aborting");
                handle.abort();
            }
        }
        info!("Async dispatcher stopped");
    }
}
