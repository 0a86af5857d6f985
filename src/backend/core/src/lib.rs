#![allow(clippy::result_large_err)]
//! # Panqueue Core
//!
//! A job queue with atomic lifecycle transitions, retries with backoff and
//! delayed jobs.
//!
//! ## Architecture
//!
//! - **Jobs**: records, options and the five-state lifecycle
//! - **Stores**: a Redis backend (one Lua script per transition) and an
//!   in-memory backend with the same semantics
//! - **Connection**: idempotent connect, dedicated pub/sub connections
//! - **Worker**: bounded-concurrency consumer loop woken by notifications
//! - **Scheduler**: promotion of due delayed jobs
//! - **Telemetry**: structured logging and `panqueue_*` metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, RedisSettings};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, QueueError, Result};
    pub use crate::jobs::{
        handler_fn, Backoff, Completion, ConnectionOptions, DelayedPromoter, EnqueueOutcome,
        FailOutcome, InMemoryStore, JobError, JobHandler, JobId, JobOptions, JobQueue, JobRecord,
        JobResult, JobStatus, JobWorker, Payload, QueueCounts, QueueStore, RedisStore,
        StoreConnection, WorkerConfig, WorkerHandle,
    };
}
