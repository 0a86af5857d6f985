//! Delayed job promotion.
//!
//! [`DelayedPromoter`] periodically moves due jobs from the delayed set to
//! the waiting list. Promotion is atomic in the store, so any number of
//! promoters (in any number of processes) may run against the same queue.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::queue::{JobQueue, DEFAULT_PROMOTE_BATCH};

/// Configuration for the promoter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoterConfig {
    /// Time between passes (milliseconds)
    pub interval_ms: u64,
    /// Maximum jobs moved per script call
    pub batch_size: usize,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            batch_size: DEFAULT_PROMOTE_BATCH,
        }
    }
}

/// Handle for controlling a running promoter.
pub struct PromoterHandle {
    shutdown: watch::Sender<bool>,
    promoted: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl PromoterHandle {
    /// Signal the promoter to stop after its current pass.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Jobs promoted by this promoter so far.
    pub fn promoted(&self) -> u64 {
        self.promoted.load(Ordering::Relaxed)
    }

    /// Wait for the promoter task to exit. Returns the final promoted count.
    pub async fn join(self) -> u64 {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Promoter task panicked");
        }
        self.promoted.load(Ordering::Relaxed)
    }
}

/// Background task promoting due delayed jobs.
pub struct DelayedPromoter {
    config: PromoterConfig,
}

impl DelayedPromoter {
    pub fn new(config: PromoterConfig) -> Self {
        Self { config }
    }

    /// Run one pass: keep promoting while each call fills a whole batch.
    ///
    /// Returns the number of jobs promoted.
    pub async fn run_once(queue: &JobQueue, batch_size: usize) -> crate::error::Result<usize> {
        let batch_size = batch_size.max(1);
        let mut total = 0;
        loop {
            let promotion = queue.promote_delayed(batch_size).await?;
            let drained = promotion.drained();
            total += promotion.promoted;
            if drained < batch_size {
                return Ok(total);
            }
        }
    }

    /// Start the promoter, returning a handle for control.
    pub fn start(self, queue: JobQueue) -> PromoterHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let promoted = Arc::new(AtomicU64::new(0));
        let counter = promoted.clone();
        let config = self.config;

        let task = tokio::spawn(async move {
            let interval = Duration::from_millis(config.interval_ms.max(1));
            let mut detached = false;
            tracing::debug!(queue = %queue.id(), interval_ms = config.interval_ms, "Promoter started");

            loop {
                match Self::run_once(&queue, config.batch_size).await {
                    Ok(count) => {
                        counter.fetch_add(count as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue.id(), error = %e, "Promotion pass failed");
                    }
                }

                tokio::select! {
                    changed = shutdown_rx.changed(), if !detached => match changed {
                        Ok(()) if *shutdown_rx.borrow() => break,
                        Ok(()) => {}
                        // Handle dropped: keep running until the runtime stops.
                        Err(_) => detached = true,
                    },
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            tracing::debug!(queue = %queue.id(), "Promoter stopped");
        });

        PromoterHandle {
            shutdown: shutdown_tx,
            promoted,
            task,
        }
    }
}
