//! Job worker for concurrent job execution.
//!
//! The consumer loop:
//!
//! 1. On startup, fails every active job older than the stall threshold so
//!    that jobs claimed by a crashed worker are retried, never lost.
//! 2. Claims jobs while a concurrency permit is available.
//! 3. When the queue is empty, waits for a notification, the poll interval
//!    or shutdown, whichever comes first. Notifications are only a hint.
//! 4. Runs each job in its own task and reports the outcome through
//!    `complete` or `fail`. Handler errors, timeouts and panics all become
//!    `fail` calls; they never stop the loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::job::{JobError, JobRecord, JobResult};
use super::queue::{JobQueue, DEFAULT_RECOVERY_BATCH};
use super::scheduler::{DelayedPromoter, PromoterConfig, PromoterHandle};
use super::store::{Completion, FailOutcome, Subscription};
use crate::telemetry::metrics::QueueMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// User-supplied processing function.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &JobRecord) -> JobResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: &JobRecord) -> JobResult {
        (self.0)(job.clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration and Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Upper bound on an idle wait without a notification (milliseconds)
    pub poll_interval_ms: u64,
    /// Time to wait for in-flight jobs on shutdown (seconds)
    pub shutdown_timeout_secs: u64,
    /// Worker name; a random suffix is added to form the claimant id
    pub name: String,
    /// Active jobs claimed longer ago than this are treated as stalled (milliseconds)
    pub stall_threshold_ms: u64,
    /// Maximum stalled jobs handled by the startup recovery pass
    pub recovery_batch_size: usize,
    /// Per-job execution limit (milliseconds); none when unset
    pub job_timeout_ms: Option<u64>,
    /// Pause after a store error before claiming again (milliseconds)
    pub error_backoff_ms: u64,
    /// Also run a delayed-job promoter alongside the worker
    pub run_promoter: bool,
    pub promoter: PromoterConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            shutdown_timeout_secs: 30,
            name: "panqueue-worker".to_string(),
            stall_threshold_ms: 30_000,
            recovery_batch_size: DEFAULT_RECOVERY_BATCH,
            job_timeout_ms: None,
            error_backoff_ms: 1000,
            run_promoter: true,
            promoter: PromoterConfig::default(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs processed (any outcome)
    pub processed: Arc<AtomicU64>,
    /// Jobs completed
    pub succeeded: Arc<AtomicU64>,
    /// Jobs failed with no retries left
    pub failed: Arc<AtomicU64>,
    /// Failed attempts rescheduled for retry
    pub retried: Arc<AtomicU64>,
    /// Outcomes rejected because the job was no longer active
    pub stale: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a running worker.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] leaves the
/// worker running in the background.
pub struct WorkerHandle {
    worker_id: String,
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
    promoter: Option<PromoterHandle>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(promoter) = &self.promoter {
            promoter.shutdown();
        }
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Claimant id written into `claimedBy`.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Wait for the worker (and its promoter) to stop.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(worker = %self.worker_id, error = %e, "Worker task panicked");
        }
        if let Some(promoter) = self.promoter {
            promoter.join().await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Job worker that processes jobs from a queue.
pub struct JobWorker {
    config: WorkerConfig,
    stats: WorkerStats,
}

struct WorkerContext {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    stats: WorkerStats,
    worker_id: String,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Start the worker, returning a handle for control.
    pub fn start<H: JobHandler>(self, queue: JobQueue, handler: H) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let suffix = Uuid::new_v4().simple().to_string();
        let worker_id = format!("{}-{}", self.config.name, &suffix[..8]);

        let promoter = self.config.run_promoter.then(|| {
            DelayedPromoter::new(self.config.promoter.clone()).start(queue.clone())
        });

        let ctx = Arc::new(WorkerContext {
            queue,
            handler: Arc::new(handler),
            config: self.config,
            stats: self.stats.clone(),
            worker_id: worker_id.clone(),
        });
        let task = tokio::spawn(run_loop(ctx, shutdown_rx));

        WorkerHandle {
            worker_id,
            shutdown: shutdown_tx,
            stats: self.stats,
            task,
            promoter,
        }
    }
}

/// Resolves once shutdown has been requested. A dropped sender never resolves.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn next_hint(subscription: &mut Option<Subscription>) -> bool {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Subscribe for wake-up hints, giving up after one poll interval or on
/// shutdown. Claiming never waits on the subscription.
async fn subscribe(
    ctx: &WorkerContext,
    wait: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Subscription> {
    let attempt = tokio::select! {
        attempt = tokio::time::timeout(wait, ctx.queue.subscribe()) => attempt,
        _ = shutdown_requested(shutdown_rx) => return None,
    };
    match attempt {
        Ok(Ok(sub)) => Some(sub),
        Ok(Err(e)) => {
            tracing::warn!(
                worker = %ctx.worker_id,
                queue = %ctx.queue.id(),
                error = %e,
                "Subscription unavailable; polling only"
            );
            None
        }
        Err(_) => {
            tracing::warn!(
                worker = %ctx.worker_id,
                queue = %ctx.queue.id(),
                wait_ms = wait.as_millis() as u64,
                "Subscription timed out; polling only"
            );
            None
        }
    }
}

async fn run_loop(ctx: Arc<WorkerContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let config = &ctx.config;
    let concurrency = config.concurrency.max(1);
    let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
    let error_backoff = Duration::from_millis(config.error_backoff_ms);

    tracing::info!(
        worker = %ctx.worker_id,
        queue = %ctx.queue.id(),
        concurrency,
        "Job worker started"
    );

    if let Err(e) = ctx
        .queue
        .recover_stalled(config.stall_threshold_ms, config.recovery_batch_size)
        .await
    {
        tracing::warn!(worker = %ctx.worker_id, error = %e, "Startup recovery failed");
    }

    let mut subscription = subscribe(&ctx, poll_interval, &mut shutdown_rx).await;
    let semaphore = Arc::new(Semaphore::new(concurrency));

    loop {
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_requested(&mut shutdown_rx) => break,
        };

        match ctx.queue.claim(&ctx.worker_id).await {
            Ok(Some(job)) => {
                tokio::spawn(process(ctx.clone(), job, permit));
                continue;
            }
            Ok(None) => {
                drop(permit);
                let woke = tokio::select! {
                    woke = next_hint(&mut subscription) => Some(woke),
                    _ = tokio::time::sleep(poll_interval) => None,
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                };
                match woke {
                    Some(true) => {}
                    Some(false) => {
                        tracing::warn!(worker = %ctx.worker_id, "Subscription closed; polling only");
                        subscription = None;
                    }
                    None if subscription.is_none() => {
                        subscription = subscribe(&ctx, poll_interval, &mut shutdown_rx).await
                    }
                    None => {}
                }
            }
            Err(e) if e.is_invariant_violation() => {
                // Already logged as critical; the offending id is gone from waiting.
                drop(permit);
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(worker = %ctx.worker_id, error = %e, "Claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(error_backoff) => {}
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                }
            }
        }
    }

    tracing::info!(
        worker = %ctx.worker_id,
        active = ctx.stats.active(),
        "Worker shutting down"
    );

    let drain = semaphore.acquire_many(concurrency as u32);
    match tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), drain).await {
        Ok(_) => tracing::info!(worker = %ctx.worker_id, "Worker stopped"),
        Err(_) => tracing::warn!(
            worker = %ctx.worker_id,
            active = ctx.stats.active(),
            "Shutdown timeout elapsed with jobs still running; they will be recovered as stalled"
        ),
    };
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn execute(ctx: &WorkerContext, job: JobRecord) -> Result<(), String> {
    let handler = ctx.handler.clone();
    let mut run = tokio::spawn(async move { handler.handle(&job).await });

    let joined = match ctx.config.job_timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), &mut run).await {
            Ok(joined) => joined,
            Err(_) => {
                run.abort();
                return Err(JobError::new(format!("job timed out after {} ms", ms)).reason());
            }
        },
        None => run.await,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.reason()),
        Err(e) if e.is_panic() => Err(format!("job handler panicked: {}", panic_message(e.into_panic()))),
        Err(e) => Err(format!("job handler was cancelled: {}", e)),
    }
}

async fn process(ctx: Arc<WorkerContext>, job: JobRecord, permit: OwnedSemaphorePermit) {
    let span = tracing::info_span!(
        "job",
        worker = %ctx.worker_id,
        queue = %ctx.queue.id(),
        job_id = %job.id,
        attempt = job.attempts
    );
    run_job(ctx, job, permit).instrument(span).await
}

async fn run_job(ctx: Arc<WorkerContext>, job: JobRecord, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    let stats = &ctx.stats;
    stats.active.fetch_add(1, Ordering::Relaxed);

    let id = job.id.clone();
    let attempt = job.attempts;

    let started = Instant::now();
    let outcome = execute(&ctx, job).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(()) => {
            QueueMetrics::job_duration(ctx.queue.id(), "completed", elapsed);
            match ctx.queue.complete(&id).await {
                Ok(Completion::Completed(_)) => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Completion::Stale) => {
                    stats.stale.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::error!(
                    worker = %ctx.worker_id,
                    job_id = %id,
                    error = %e,
                    "Could not record completion; job stays active until recovered"
                ),
            }
        }
        Err(reason) => {
            QueueMetrics::job_duration(ctx.queue.id(), "failed", elapsed);
            tracing::debug!(worker = %ctx.worker_id, job_id = %id, attempt, reason = %reason, "Job attempt failed");
            match ctx.queue.fail(&id, &reason).await {
                Ok(FailOutcome::Retrying { .. }) => {
                    stats.retried.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FailOutcome::Failed(_)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FailOutcome::Stale) => {
                    stats.stale.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::error!(
                    worker = %ctx.worker_id,
                    job_id = %id,
                    error = %e,
                    "Could not record failure; job stays active until recovered"
                ),
            }
        }
    }

    stats.processed.fetch_add(1, Ordering::Relaxed);
    stats.active.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.stall_threshold_ms, 30_000);
        assert!(config.job_timeout_ms.is_none());
    }

    #[test]
    fn test_worker_config_partial_deserialize() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"concurrency": 8, "job_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.job_timeout_ms, Some(500));
        assert_eq!(config.name, "panqueue-worker");
    }

    #[test]
    fn test_worker_config_partial_promoter() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"promoter": {"interval_ms": 250}}"#).unwrap();
        assert_eq!(config.promoter.interval_ms, 250);
        assert_eq!(config.promoter.batch_size, crate::jobs::queue::DEFAULT_PROMOTE_BATCH);
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.succeeded(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.retried(), 0);
        assert_eq!(stats.stale(), 0);
        assert_eq!(stats.active(), 0);

        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.processed(), 1);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic");
    }
}
