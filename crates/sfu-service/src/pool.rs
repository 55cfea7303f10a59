//! Engine worker pool.
//!
//! Workers are created once at startup and never replaced. Rooms are placed
//! on workers round-robin. A worker dying is fatal: [`WorkerPool::watch_for_death`]
//! reports it and the binary exits so a supervisor restarts a clean process.

use crate::engine::{EngineWorker, MediaEngine, WorkerSettings};
use crate::errors::SfuError;

use common::types::WorkerId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A worker died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub worker_id: WorkerId,
    pub reason: String,
}

/// Fixed set of engine workers with a round-robin cursor.
pub struct WorkerPool {
    workers: Vec<Arc<dyn EngineWorker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Create `num_workers` workers on `engine`.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` if `num_workers` is zero, `Engine` if any worker
    /// fails to start (workers created so far are closed).
    pub async fn start(
        engine: &dyn MediaEngine,
        num_workers: usize,
        settings: &WorkerSettings,
    ) -> Result<Self, SfuError> {
        if num_workers == 0 {
            return Err(SfuError::PoolExhausted);
        }

        let mut workers: Vec<Arc<dyn EngineWorker>> = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            match engine.create_worker(settings).await {
                Ok(worker) => {
                    info!(
                        target: "sfu.pool",
                        worker_id = %worker.id(),
                        index,
                        "Engine worker started"
                    );
                    workers.push(worker);
                }
                Err(e) => {
                    error!(target: "sfu.pool", index, error = %e, "Engine worker failed to start");
                    for worker in &workers {
                        worker.close();
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(Self::from_workers(workers))
    }

    /// Wrap already created workers.
    #[must_use]
    pub fn from_workers(workers: Vec<Arc<dyn EngineWorker>>) -> Self {
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Next worker in round-robin order.
    pub fn acquire(&self) -> Result<Arc<dyn EngineWorker>, SfuError> {
        if self.workers.is_empty() {
            return Err(SfuError::PoolExhausted);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers
            .get(index)
            .cloned()
            .ok_or(SfuError::PoolExhausted)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn one watcher per worker. The receiver yields every death until
    /// `cancel_token` fires.
    pub fn watch_for_death(&self, cancel_token: CancellationToken) -> mpsc::Receiver<WorkerDeath> {
        let (tx, rx) = mpsc::channel(self.workers.len().max(1));

        for worker in &self.workers {
            let worker_id = worker.id();
            let signal = worker.died();
            let tx = tx.clone();
            let cancel_token = cancel_token.clone();

            tokio::spawn(async move {
                let reason = tokio::select! {
                    () = cancel_token.cancelled() => return,
                    reason = signal.died() => reason,
                };
                if let Some(reason) = reason {
                    let _ = tx.send(WorkerDeath { worker_id, reason }).await;
                }
            });
        }

        rx
    }

    /// Close every worker (normal shutdown, no death signal).
    pub fn close_all(&self) {
        for worker in &self.workers {
            worker.close();
        }
        info!(target: "sfu.pool", workers = self.workers.len(), "Engine workers closed");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("next", &self.next)
            .finish()
    }
}
