//! The transition engine seam.
//!
//! A [`QueueStore`] owns the state of many queues and applies every lifecycle
//! transition as one indivisible step. Two implementations exist:
//! [`InMemoryStore`](super::memory::InMemoryStore) and
//! [`RedisStore`](super::redis::RedisStore).
//!
//! All operations take the caller's clock (`now`, Unix ms) so that both
//! backends behave identically and deterministically under test.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::job::{JobId, JobRecord, JobStatus, NewJob};
use crate::error::Result;

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new record was written.
    Created(JobRecord),
    /// A record with the same id already existed and was left untouched.
    Existing(JobRecord),
}

impl EnqueueOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.record().id
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Result of a complete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed(JobRecord),
    /// The job was not active; nothing changed.
    Stale,
}

/// Result of a fail call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Moved to the delayed set, claimable again once `due_at` has passed.
    Retrying { record: JobRecord, due_at: i64 },
    /// Retry budget spent; moved to the failed set.
    Failed(JobRecord),
    /// The job was not active; nothing changed.
    Stale,
}

/// Result of a promotion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    /// Number of jobs moved from delayed to waiting.
    pub promoted: usize,
    /// Delayed ids with no backing record. Removed from the delayed set.
    pub orphaned: Vec<JobId>,
    /// Delayed ids whose record could not be decoded. Moved to the failed set.
    #[serde(default)]
    pub corrupt: Vec<JobId>,
}

impl Promotion {
    /// Entries taken off the delayed set, promoted or not.
    pub fn drained(&self) -> usize {
        self.promoted + self.orphaned.len() + self.corrupt.len()
    }
}

/// Result of a stall recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recovery {
    /// Stalled jobs rescheduled for another attempt.
    pub retried: Vec<JobId>,
    /// Stalled jobs that had no retries left.
    pub failed: Vec<JobId>,
    /// Active ids with no backing record. Removed from the active set.
    pub orphaned: Vec<JobId>,
    /// Active ids whose record could not be decoded. Moved to the failed set.
    #[serde(default)]
    pub corrupt: Vec<JobId>,
}

impl Recovery {
    pub fn total(&self) -> usize {
        self.retried.len() + self.failed.len() + self.orphaned.len() + self.corrupt.len()
    }
}

/// Sizes of a queue's state collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Entries in the jobs hash.
    pub jobs: usize,
}

impl QueueCounts {
    /// Sum of the five state collections. Equals `jobs` on a consistent queue.
    pub fn total_members(&self) -> usize {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// Wake-up hints for one queue.
///
/// A message means "work may be available"; it never guarantees a claim will
/// succeed, and messages may be lost. Consumers must also poll.
pub struct Subscription {
    stream: BoxStream<'static, ()>,
}

impl Subscription {
    pub fn new(stream: BoxStream<'static, ()>) -> Self {
        Self { stream }
    }

    /// Wait for the next hint. Returns `false` once the channel has closed.
    pub async fn recv(&mut self) -> bool {
        self.stream.next().await.is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Atomic lifecycle operations over a set of queues.
///
/// Every method is a single indivisible step with respect to every other
/// method on the same queue. Queue ids are validated by the implementation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Write a record and push it to waiting (or delayed when `job.delay_ms > 0`).
    /// An existing record with the same id wins, whatever its state.
    async fn enqueue(&self, queue: &str, job: NewJob, now: i64) -> Result<EnqueueOutcome>;

    /// Pop the head of the waiting list and mark it active.
    async fn claim(&self, queue: &str, claimant: &str, now: i64) -> Result<Option<JobRecord>>;

    /// active -> completed.
    async fn complete(&self, queue: &str, id: &JobId, now: i64) -> Result<Completion>;

    /// active -> delayed (retries left) or active -> failed.
    async fn fail(&self, queue: &str, id: &JobId, reason: &str, now: i64) -> Result<FailOutcome>;

    /// Move up to `limit` due delayed jobs to the tail of waiting, in due order.
    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Promotion>;

    /// Fail every active job claimed before `now - stall_threshold_ms`, using
    /// the same retry rules as [`QueueStore::fail`].
    async fn recover_stalled(
        &self,
        queue: &str,
        now: i64,
        stall_threshold_ms: u64,
        limit: usize,
    ) -> Result<Recovery>;

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Every state collection currently holding `id`. A consistent queue
    /// returns exactly one entry for any enqueued job.
    async fn memberships(&self, queue: &str, id: &JobId) -> Result<Vec<JobStatus>>;

    async fn subscribe(&self, queue: &str) -> Result<Subscription>;
}

/// Reason recorded when a stalled job is failed by recovery.
pub const STALLED_REASON: &str = "job stalled: no completion before the stall threshold";
