//! Job lifecycle engine.
//!
//! Jobs move through five states, and every move is one atomic transition
//! on the store:
//!
//! ```text
//!                enqueue(delay)                    promote
//!   producer ─────────────────────▶ delayed ───────────────────┐
//!      │                              ▲                        ▼
//!      │ enqueue                      │ fail (retries left)  waiting
//!      └──────────────────────────────┼──────────────────────▶   │
//!                                     │                          │ claim
//!                                   active ◀─────────────────────┘
//!                                     │
//!                      complete ──────┴────── fail (exhausted)
//!                         ▼                         ▼
//!                     completed                   failed
//! ```
//!
//! - **Keys**: every key of a queue shares one hash tag, `{q:<id>}`
//! - **Store**: [`QueueStore`] with an in-memory and a Redis backend
//! - **Queue**: [`JobQueue`] facade with logging and metrics
//! - **Worker**: [`JobWorker`] consumer loop with bounded concurrency
//! - **Scheduler**: [`DelayedPromoter`] moving due delayed jobs to waiting
//!
//! # Usage
//!
//! ```rust,no_run
//! use panqueue_core::jobs::{handler_fn, JobOptions, JobQueue, JobWorker, WorkerConfig};
//!
//! # async fn example() -> panqueue_core::Result<()> {
//! let queue = JobQueue::in_memory("emails")?;
//! queue.enqueue(&"hello", JobOptions::new().with_retries(3)).await?;
//!
//! let handle = JobWorker::new(WorkerConfig::default()).start(
//!     queue.clone(),
//!     handler_fn(|job| async move {
//!         tracing::info!(job_id = %job.id, "Processing");
//!         Ok(())
//!     }),
//! );
//!
//! handle.shutdown();
//! handle.join().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod job;
pub mod keys;
pub mod memory;
pub mod queue;
pub mod redis;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use connection::{
    redact_url, ClientFactory, ConnectionOptions, ConnectionParams, RedisClientFactory,
    RedisHandle, StoreConnection,
};
pub use job::{
    now_ms, Backoff, BackoffKind, JobError, JobId, JobOptions, JobRecord, JobResult, JobStatus,
    NewJob, Payload,
};
pub use keys::{queue_key, validate_queue_id, QueueKeys};
pub use memory::InMemoryStore;
pub use queue::JobQueue;
pub use redis::RedisStore;
pub use scheduler::{DelayedPromoter, PromoterConfig, PromoterHandle};
pub use store::{
    Completion, EnqueueOutcome, FailOutcome, Promotion, QueueCounts, QueueStore, Recovery,
    Subscription,
};
pub use worker::{handler_fn, JobHandler, JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
