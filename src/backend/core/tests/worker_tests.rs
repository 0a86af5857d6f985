//! Consumer loop tests against the in-memory store.
//!
//! Tests cover:
//! - Completion and failure mapping
//! - Retry through the built-in promoter
//! - Panics and timeouts inside handlers
//! - Concurrency limits
//! - Startup stall recovery
//! - Notification wake-ups and graceful shutdown
//! - Claiming while the notification channel hangs

use async_trait::async_trait;
use panqueue_core::error::Result;
use panqueue_core::jobs::{
    handler_fn, now_ms, Backoff, Completion, EnqueueOutcome, FailOutcome, InMemoryStore, JobError,
    JobHandler, JobId, JobOptions, JobQueue, JobRecord, JobResult, JobStatus, JobWorker, NewJob,
    Promotion, PromoterConfig, QueueCounts, QueueStore, Recovery, Subscription, WorkerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 4,
        poll_interval_ms: 20,
        shutdown_timeout_secs: 5,
        name: "test-worker".to_string(),
        error_backoff_ms: 10,
        run_promoter: true,
        promoter: PromoterConfig {
            interval_ms: 10,
            batch_size: 100,
        },
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Outcome Mapping
// ============================================================================

#[tokio::test]
async fn test_worker_completes_jobs() {
    let queue = JobQueue::in_memory("work").unwrap();
    for i in 0..10 {
        queue.enqueue(&i, JobOptions::new()).await.unwrap();
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let handle = JobWorker::new(config()).start(
        queue.clone(),
        handler_fn(move |job: JobRecord| {
            let counter = counter.clone();
            async move {
                let n: u32 = job.data.decode()?;
                assert!(n < 10);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    wait_until(|| handle.stats().succeeded() == 10).await;
    assert!(handle.worker_id().starts_with("test-worker-"));
    handle.shutdown();
    handle.join().await;

    assert_eq!(seen.load(Ordering::SeqCst), 10);
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, 10);
    assert_eq!(counts.active, 0);
}

#[tokio::test]
async fn test_worker_retries_then_fails() {
    let queue = JobQueue::in_memory("work").unwrap();
    let id = queue
        .enqueue(
            &"flaky",
            JobOptions::new().with_retries(2).with_backoff(Backoff::fixed(5)),
        )
        .await
        .unwrap()
        .id()
        .clone();

    let handle = JobWorker::new(config()).start(
        queue.clone(),
        handler_fn(|_job: JobRecord| async move {
            Err(JobError::new("upstream unavailable").with_code("E_UPSTREAM"))
        }),
    );

    wait_until(|| handle.stats().processed() == 3).await;
    assert_eq!(handle.stats().retried(), 2);
    assert_eq!(handle.stats().failed(), 1);
    handle.shutdown();
    handle.join().await;

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.failed_reason.unwrap().contains("upstream unavailable"));
}

#[tokio::test]
async fn test_worker_eventually_succeeds_after_retry() {
    let queue = JobQueue::in_memory("work").unwrap();
    let id = queue
        .enqueue(&"second time lucky", JobOptions::new().with_retries(1))
        .await
        .unwrap()
        .id()
        .clone();

    let handle = JobWorker::new(config()).start(
        queue.clone(),
        handler_fn(|job: JobRecord| async move {
            if job.attempts == 1 {
                Err(JobError::new("first attempt fails"))
            } else {
                Ok(())
            }
        }),
    );

    wait_until(|| handle.stats().succeeded() == 1).await;
    handle.shutdown();
    handle.join().await;

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn test_panicking_handler_fails_job() {
    let queue = JobQueue::in_memory("work").unwrap();
    let id = queue.enqueue(&"bad", JobOptions::new()).await.unwrap().id().clone();

    let handle = JobWorker::new(config()).start(
        queue.clone(),
        handler_fn(|_job: JobRecord| async move {
            if true {
                panic!("handler exploded");
            }
            Ok(())
        }),
    );

    wait_until(|| handle.stats().failed() == 1).await;
    handle.shutdown();
    handle.join().await;

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    let reason = record.failed_reason.unwrap();
    assert!(reason.contains("panicked"), "{}", reason);
    assert!(reason.contains("handler exploded"), "{}", reason);
}

#[tokio::test]
async fn test_job_timeout_fails_job() {
    let queue = JobQueue::in_memory("work").unwrap();
    let id = queue.enqueue(&"slow", JobOptions::new()).await.unwrap().id().clone();

    let handle = JobWorker::new(WorkerConfig {
        job_timeout_ms: Some(30),
        ..config()
    })
    .start(
        queue.clone(),
        handler_fn(|_job: JobRecord| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }),
    );

    wait_until(|| handle.stats().failed() == 1).await;
    handle.shutdown();
    handle.join().await;

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert!(record.failed_reason.unwrap().contains("timed out"));
}

// ============================================================================
// Handler Trait
// ============================================================================

#[derive(Clone, Default)]
struct Recorder {
    ids: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, job: &JobRecord) -> JobResult {
        self.ids.lock().push(job.id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_trait_handler_processes_in_fifo_order() {
    let queue = JobQueue::in_memory("work").unwrap();
    for id in ["a", "b", "c"] {
        queue
            .enqueue(&id, JobOptions::new().with_job_id(id))
            .await
            .unwrap();
    }

    let recorder = Recorder::default();
    let handle = JobWorker::new(WorkerConfig {
        concurrency: 1,
        ..config()
    })
    .start(queue.clone(), recorder.clone());

    wait_until(|| handle.stats().succeeded() == 3).await;
    handle.shutdown();
    handle.join().await;

    assert_eq!(*recorder.ids.lock(), vec!["a", "b", "c"]);
}

// ============================================================================
// Concurrency and Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_respected() {
    let queue = JobQueue::in_memory("work").unwrap();
    for i in 0..12 {
        queue.enqueue(&i, JobOptions::new()).await.unwrap();
    }

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current, max) = (in_flight.clone(), peak.clone());

    let handle = JobWorker::new(WorkerConfig {
        concurrency: 3,
        ..config()
    })
    .start(
        queue.clone(),
        handler_fn(move |_job: JobRecord| {
            let (current, max) = (current.clone(), max.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    wait_until(|| handle.stats().succeeded() == 12).await;
    handle.shutdown();
    handle.join().await;

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {}", peak);
    assert!(peak >= 2, "jobs never overlapped");
}

#[tokio::test]
async fn test_startup_recovers_stalled_jobs() {
    let queue = JobQueue::in_memory("work").unwrap();
    let id = queue
        .enqueue(&"orphaned", JobOptions::new().with_retries(1))
        .await
        .unwrap()
        .id()
        .clone();

    // A worker that claimed the job a minute ago and died.
    queue
        .claim_at("crashed-worker", now_ms() - 60_000)
        .await
        .unwrap()
        .unwrap();

    let handle = JobWorker::new(WorkerConfig {
        stall_threshold_ms: 1_000,
        ..config()
    })
    .start(queue.clone(), handler_fn(|_job: JobRecord| async move { Ok(()) }));

    wait_until(|| handle.stats().succeeded() == 1).await;
    let worker_id = handle.worker_id().to_string();
    handle.shutdown();
    handle.join().await;

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.claimed_by.as_deref(), Some(worker_id.as_str()));
}

#[tokio::test]
async fn test_notification_wakes_idle_worker() {
    let queue = JobQueue::in_memory("work").unwrap();
    let handle = JobWorker::new(WorkerConfig {
        poll_interval_ms: 60_000,
        run_promoter: false,
        ..config()
    })
    .start(queue.clone(), handler_fn(|_job: JobRecord| async move { Ok(()) }));

    // Let the worker reach its idle wait.
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.enqueue(&"ping", JobOptions::new()).await.unwrap();

    wait_until(|| handle.stats().succeeded() == 1).await;
    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_jobs() {
    let queue = JobQueue::in_memory("work").unwrap();
    let id = queue.enqueue(&"long", JobOptions::new()).await.unwrap().id().clone();

    let handle = JobWorker::new(config()).start(
        queue.clone(),
        handler_fn(|_job: JobRecord| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }),
    );

    wait_until(|| handle.stats().active() == 1).await;
    handle.shutdown();
    handle.join().await;

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_shutdown_stops_claiming() {
    let queue = JobQueue::in_memory("work").unwrap();
    let handle = JobWorker::new(config()).start(
        queue.clone(),
        handler_fn(|_job: JobRecord| async move { Ok(()) }),
    );

    handle.shutdown();
    handle.join().await;

    queue.enqueue(&"after", JobOptions::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.counts().await.unwrap().waiting, 1);
}

// ============================================================================
// Unreachable Notification Channel
// ============================================================================

/// In-memory store whose subscribe never resolves.
#[derive(Default)]
struct HangingSubscribe {
    inner: InMemoryStore,
}

#[async_trait]
impl QueueStore for HangingSubscribe {
    fn name(&self) -> &'static str {
        "hanging-subscribe"
    }

    async fn enqueue(&self, queue: &str, job: NewJob, now: i64) -> Result<EnqueueOutcome> {
        self.inner.enqueue(queue, job, now).await
    }

    async fn claim(&self, queue: &str, claimant: &str, now: i64) -> Result<Option<JobRecord>> {
        self.inner.claim(queue, claimant, now).await
    }

    async fn complete(&self, queue: &str, id: &JobId, now: i64) -> Result<Completion> {
        self.inner.complete(queue, id, now).await
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str, now: i64) -> Result<FailOutcome> {
        self.inner.fail(queue, id, reason, now).await
    }

    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Promotion> {
        self.inner.promote_delayed(queue, now, limit).await
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        now: i64,
        stall_threshold_ms: u64,
        limit: usize,
    ) -> Result<Recovery> {
        self.inner
            .recover_stalled(queue, now, stall_threshold_ms, limit)
            .await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>> {
        self.inner.get_job(queue, id).await
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        self.inner.counts(queue).await
    }

    async fn memberships(&self, queue: &str, id: &JobId) -> Result<Vec<JobStatus>> {
        self.inner.memberships(queue, id).await
    }

    async fn subscribe(&self, _queue: &str) -> Result<Subscription> {
        std::future::pending().await
    }
}

fn hanging_queue() -> JobQueue {
    JobQueue::new(Arc::new(HangingSubscribe::default()), "work").unwrap()
}

#[tokio::test]
async fn test_hung_subscribe_does_not_block_claiming() {
    let queue = hanging_queue();
    queue.enqueue(&"waiting", JobOptions::new()).await.unwrap();

    let handle = JobWorker::new(config()).start(
        queue.clone(),
        handler_fn(|_job: JobRecord| async move { Ok(()) }),
    );

    wait_until(|| handle.stats().succeeded() == 1).await;

    // Later jobs are still picked up by polling.
    queue.enqueue(&"later", JobOptions::new()).await.unwrap();
    wait_until(|| handle.stats().succeeded() == 2).await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("worker did not stop");
}

#[tokio::test]
async fn test_shutdown_interrupts_hung_subscribe() {
    let queue = hanging_queue();
    let handle = JobWorker::new(WorkerConfig {
        poll_interval_ms: 60_000,
        run_promoter: false,
        ..config()
    })
    .start(queue.clone(), handler_fn(|_job: JobRecord| async move { Ok(()) }));

    // Let the worker reach the subscribe call.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("worker did not stop");
}
