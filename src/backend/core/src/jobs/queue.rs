//! Producer/consumer facade over a [`QueueStore`].
//!
//! [`JobQueue`] binds a store to one queue id, stamps the clock, serialises
//! payloads, records metrics and logs every transition with structured
//! fields. Invariant violations are logged at critical severity before they
//! are returned.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use super::job::{now_ms, JobId, JobOptions, JobRecord, JobStatus, NewJob, Payload};
use super::keys::validate_queue_id;
use super::memory::InMemoryStore;
use super::store::{
    Completion, EnqueueOutcome, FailOutcome, Promotion, QueueCounts, QueueStore, Recovery,
    Subscription,
};
use crate::error::{QueueError, Result};
use crate::telemetry::metrics::QueueMetrics;

/// Default batch limits for maintenance passes.
pub const DEFAULT_PROMOTE_BATCH: usize = 100;
pub const DEFAULT_RECOVERY_BATCH: usize = 1000;

/// One queue on a shared store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    queue_id: Arc<str>,
}

impl JobQueue {
    /// Bind `store` to `queue_id`.
    pub fn new(store: Arc<dyn QueueStore>, queue_id: impl Into<String>) -> Result<Self> {
        let queue_id = queue_id.into();
        validate_queue_id(&queue_id)?;
        Ok(Self {
            store,
            queue_id: queue_id.into(),
        })
    }

    /// A queue on a fresh in-memory store (for testing).
    pub fn in_memory(queue_id: impl Into<String>) -> Result<Self> {
        Self::new(Arc::new(InMemoryStore::new()), queue_id)
    }

    pub fn id(&self) -> &str {
        &self.queue_id
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            error.log();
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producer side
    // ─────────────────────────────────────────────────────────────────────────

    /// Serialise `data` and enqueue it.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        data: &T,
        options: JobOptions,
    ) -> Result<EnqueueOutcome> {
        let payload = Payload::from_value(data)?;
        self.enqueue_payload(payload, options).await
    }

    /// Enqueue an already serialised payload.
    pub async fn enqueue_payload(
        &self,
        payload: Payload,
        options: JobOptions,
    ) -> Result<EnqueueOutcome> {
        self.enqueue_at(payload, options, now_ms()).await
    }

    /// Enqueue with an explicit clock.
    pub async fn enqueue_at(
        &self,
        payload: Payload,
        options: JobOptions,
        now: i64,
    ) -> Result<EnqueueOutcome> {
        let job = NewJob::new(payload, &options)?;
        let span = tracing::info_span!("enqueue", queue = %self.queue_id, job_id = %job.id);
        let outcome = self
            .store
            .enqueue(&self.queue_id, job, now)
            .instrument(span)
            .await;

        match &outcome {
            Ok(EnqueueOutcome::Created(record)) => {
                QueueMetrics::enqueued(&self.queue_id, record.status == JobStatus::Delayed);
                debug!(
                    queue = %self.queue_id,
                    job_id = %record.id,
                    status = %record.status,
                    "Job enqueued"
                );
            }
            Ok(EnqueueOutcome::Existing(record)) => {
                QueueMetrics::deduplicated(&self.queue_id);
                debug!(
                    queue = %self.queue_id,
                    job_id = %record.id,
                    status = %record.status,
                    "Job id already known; enqueue ignored"
                );
            }
            Err(_) => {}
        }
        self.observe(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consumer side
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn claim(&self, claimant: &str) -> Result<Option<JobRecord>> {
        self.claim_at(claimant, now_ms()).await
    }

    pub async fn claim_at(&self, claimant: &str, now: i64) -> Result<Option<JobRecord>> {
        let claimed = self.store.claim(&self.queue_id, claimant, now).await;
        if let Ok(Some(record)) = &claimed {
            QueueMetrics::claimed(&self.queue_id);
            debug!(
                queue = %self.queue_id,
                job_id = %record.id,
                attempt = record.attempts,
                worker = %claimant,
                "Job claimed"
            );
        }
        self.observe(claimed)
    }

    pub async fn complete(&self, id: &JobId) -> Result<Completion> {
        self.complete_at(id, now_ms()).await
    }

    pub async fn complete_at(&self, id: &JobId, now: i64) -> Result<Completion> {
        let completion = self.store.complete(&self.queue_id, id, now).await;
        match &completion {
            Ok(Completion::Completed(record)) => {
                QueueMetrics::completed(&self.queue_id);
                debug!(queue = %self.queue_id, job_id = %id, attempt = record.attempts, "Job completed");
            }
            Ok(Completion::Stale) => {
                QueueMetrics::stale(&self.queue_id, "complete");
                warn!(queue = %self.queue_id, job_id = %id, "Stale completion: job is not active");
            }
            Err(_) => {}
        }
        self.observe(completion)
    }

    pub async fn fail(&self, id: &JobId, reason: &str) -> Result<FailOutcome> {
        self.fail_at(id, reason, now_ms()).await
    }

    pub async fn fail_at(&self, id: &JobId, reason: &str, now: i64) -> Result<FailOutcome> {
        let outcome = self.store.fail(&self.queue_id, id, reason, now).await;
        match &outcome {
            Ok(FailOutcome::Retrying { record, due_at }) => {
                QueueMetrics::retried(&self.queue_id);
                info!(
                    queue = %self.queue_id,
                    job_id = %id,
                    attempt = record.attempts,
                    due_in_ms = due_at - now,
                    reason = %reason,
                    "Job failed; retry scheduled"
                );
            }
            Ok(FailOutcome::Failed(record)) => {
                QueueMetrics::failed(&self.queue_id);
                warn!(
                    queue = %self.queue_id,
                    job_id = %id,
                    attempt = record.attempts,
                    reason = %reason,
                    "Job failed permanently"
                );
            }
            Ok(FailOutcome::Stale) => {
                QueueMetrics::stale(&self.queue_id, "fail");
                warn!(queue = %self.queue_id, job_id = %id, "Stale failure: job is not active");
            }
            Err(_) => {}
        }
        self.observe(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn promote_delayed(&self, limit: usize) -> Result<Promotion> {
        self.promote_delayed_at(now_ms(), limit).await
    }

    pub async fn promote_delayed_at(&self, now: i64, limit: usize) -> Result<Promotion> {
        let promotion = self.store.promote_delayed(&self.queue_id, now, limit).await;
        if let Ok(promotion) = &promotion {
            QueueMetrics::promoted(&self.queue_id, promotion.promoted);
            if promotion.promoted > 0 {
                debug!(queue = %self.queue_id, promoted = promotion.promoted, "Delayed jobs promoted");
            }
            if !promotion.orphaned.is_empty() {
                QueueError::invariant_violation(
                    &self.queue_id,
                    &join_ids(&promotion.orphaned),
                    "delayed ids without job records were dropped",
                )
                .log();
            }
            if !promotion.corrupt.is_empty() {
                QueueError::invariant_violation(
                    &self.queue_id,
                    &join_ids(&promotion.corrupt),
                    "delayed job records could not be decoded; ids moved to failed",
                )
                .log();
            }
        }
        self.observe(promotion)
    }

    pub async fn recover_stalled(&self, stall_threshold_ms: u64, limit: usize) -> Result<Recovery> {
        self.recover_stalled_at(now_ms(), stall_threshold_ms, limit).await
    }

    pub async fn recover_stalled_at(
        &self,
        now: i64,
        stall_threshold_ms: u64,
        limit: usize,
    ) -> Result<Recovery> {
        let recovery = self
            .store
            .recover_stalled(&self.queue_id, now, stall_threshold_ms, limit)
            .await;
        if let Ok(recovery) = &recovery {
            QueueMetrics::recovered(&self.queue_id, "retry", recovery.retried.len());
            QueueMetrics::recovered(&self.queue_id, "failed", recovery.failed.len());
            QueueMetrics::recovered(&self.queue_id, "orphaned", recovery.orphaned.len());
            QueueMetrics::recovered(&self.queue_id, "corrupt", recovery.corrupt.len());
            if recovery.total() > 0 {
                info!(
                    queue = %self.queue_id,
                    retried = recovery.retried.len(),
                    failed = recovery.failed.len(),
                    orphaned = recovery.orphaned.len(),
                    corrupt = recovery.corrupt.len(),
                    "Recovered stalled jobs"
                );
            }
            if !recovery.orphaned.is_empty() {
                QueueError::invariant_violation(
                    &self.queue_id,
                    &join_ids(&recovery.orphaned),
                    "active ids without job records were cleared",
                )
                .log();
            }
            if !recovery.corrupt.is_empty() {
                QueueError::invariant_violation(
                    &self.queue_id,
                    &join_ids(&recovery.corrupt),
                    "active job records could not be decoded; ids moved to failed",
                )
                .log();
            }
        }
        self.observe(recovery)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.store.get_job(&self.queue_id, id).await
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let counts = self.store.counts(&self.queue_id).await?;
        QueueMetrics::depth(&self.queue_id, &counts);
        Ok(counts)
    }

    pub async fn memberships(&self, id: &JobId) -> Result<Vec<JobStatus>> {
        self.store.memberships(&self.queue_id, id).await
    }

    pub async fn subscribe(&self) -> Result<Subscription> {
        self.store.subscribe(&self.queue_id).await
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("queue_id", &self.queue_id)
            .field("store", &self.store.name())
            .finish()
    }
}

fn join_ids(ids: &[JobId]) -> String {
    ids.iter().map(JobId::as_str).collect::<Vec<_>>().join(",")
}
