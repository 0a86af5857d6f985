//! In-memory queue store.
//!
//! Each queue is owned by a single `parking_lot::Mutex`, so every operation
//! on a queue runs as one critical section: a partitioned single-writer per
//! queue. Notifications use a `tokio::sync::broadcast` channel per queue.
//!
//! Suitable for tests and for embedding in a single process. Nothing is
//! persisted.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::job::{JobId, JobRecord, JobStatus, NewJob};
use super::keys::validate_queue_id;
use super::store::{
    Completion, EnqueueOutcome, FailOutcome, Promotion, QueueCounts, QueueStore, Recovery,
    Subscription, STALLED_REASON,
};
use crate::error::{QueueError, Result};

const NOTIFY_CAPACITY: usize = 64;

/// State collections of one queue.
#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, JobRecord>,
    waiting: VecDeque<JobId>,
    active: HashSet<JobId>,
    /// (due, seq) -> id. `seq` breaks ties in insertion order.
    delayed: BTreeMap<(i64, u64), JobId>,
    delayed_index: HashMap<JobId, (i64, u64)>,
    completed: HashSet<JobId>,
    failed: HashSet<JobId>,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_delayed(&mut self, id: JobId, due: i64, seq: u64) {
        self.delayed_index.insert(id.clone(), (due, seq));
        self.delayed.insert((due, seq), id);
    }

    /// Shared by `fail` and stall recovery. The caller has checked that `id`
    /// is in the active set.
    fn fail_active(&mut self, queue: &str, id: &JobId, reason: &str, now: i64) -> Result<FailOutcome> {
        let seq = self.seq + 1;
        let Some(record) = self.jobs.get_mut(id) else {
            self.active.remove(id);
            return Err(QueueError::invariant_violation(
                queue,
                id.as_str(),
                "active id has no job record",
            ));
        };

        self.active.remove(id);
        match record.retry_due(now) {
            Some(due_at) => {
                record.mark_retrying(reason, seq);
                let record = record.clone();
                self.seq = seq;
                self.push_delayed(id.clone(), due_at, seq);
                Ok(FailOutcome::Retrying { record, due_at })
            }
            None => {
                record.mark_failed(reason, now);
                let record = record.clone();
                self.failed.insert(id.clone());
                Ok(FailOutcome::Failed(record))
            }
        }
    }

    fn memberships(&self, id: &JobId) -> Vec<JobStatus> {
        let mut found = Vec::new();
        if self.waiting.contains(id) {
            found.push(JobStatus::Waiting);
        }
        if self.delayed_index.contains_key(id) {
            found.push(JobStatus::Delayed);
        }
        if self.active.contains(id) {
            found.push(JobStatus::Active);
        }
        if self.completed.contains(id) {
            found.push(JobStatus::Completed);
        }
        if self.failed.contains(id) {
            found.push(JobStatus::Failed);
        }
        found
    }
}

struct QueueSlot {
    state: Mutex<QueueState>,
    notify: broadcast::Sender<()>,
}

impl QueueSlot {
    fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            notify,
        }
    }

    fn wake(&self) {
        // No receivers is fine: the hint is advisory.
        let _ = self.notify.send(());
    }
}

/// In-process [`QueueStore`].
#[derive(Default)]
pub struct InMemoryStore {
    queues: DashMap<String, Arc<QueueSlot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, queue: &str) -> Result<Arc<QueueSlot>> {
        validate_queue_id(queue)?;
        if let Some(slot) = self.queues.get(queue) {
            return Ok(slot.clone());
        }
        Ok(self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueSlot::new()))
            .clone())
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, queue: &str, job: NewJob, now: i64) -> Result<EnqueueOutcome> {
        let slot = self.slot(queue)?;
        let outcome = {
            let mut state = slot.state.lock();
            if let Some(existing) = state.jobs.get(&job.id) {
                return Ok(EnqueueOutcome::Existing(existing.clone()));
            }

            let seq = state.next_seq();
            let run_at = job.run_at(now);
            let record = job.into_record(queue, now, seq);
            let id = record.id.clone();
            state.jobs.insert(id.clone(), record.clone());
            match run_at {
                Some(due) => state.push_delayed(id, due, seq),
                None => state.waiting.push_back(id),
            }
            EnqueueOutcome::Created(record)
        };

        if outcome.record().status == JobStatus::Waiting {
            slot.wake();
        }
        Ok(outcome)
    }

    async fn claim(&self, queue: &str, claimant: &str, now: i64) -> Result<Option<JobRecord>> {
        let slot = self.slot(queue)?;
        let mut guard = slot.state.lock();
        let state = &mut *guard;

        let Some(id) = state.waiting.pop_front() else {
            return Ok(None);
        };
        let Some(record) = state.jobs.get_mut(&id) else {
            return Err(QueueError::invariant_violation(
                queue,
                id.as_str(),
                "waiting id has no job record",
            ));
        };

        record.mark_active(claimant, now);
        let record = record.clone();
        state.active.insert(id);
        Ok(Some(record))
    }

    async fn complete(&self, queue: &str, id: &JobId, now: i64) -> Result<Completion> {
        let slot = self.slot(queue)?;
        let mut guard = slot.state.lock();
        let state = &mut *guard;

        if !state.active.remove(id) {
            return Ok(Completion::Stale);
        }
        let Some(record) = state.jobs.get_mut(id) else {
            return Err(QueueError::invariant_violation(
                queue,
                id.as_str(),
                "active id has no job record",
            ));
        };

        record.mark_completed(now);
        let record = record.clone();
        state.completed.insert(id.clone());
        Ok(Completion::Completed(record))
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str, now: i64) -> Result<FailOutcome> {
        let slot = self.slot(queue)?;
        let mut state = slot.state.lock();

        if !state.active.contains(id) {
            return Ok(FailOutcome::Stale);
        }
        state.fail_active(queue, id, reason, now)
    }

    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Promotion> {
        let slot = self.slot(queue)?;
        let promotion = {
            let mut guard = slot.state.lock();
            let state = &mut *guard;

            let due: Vec<(i64, u64)> = state
                .delayed
                .range(..=(now, u64::MAX))
                .take(limit)
                .map(|(score, _)| *score)
                .collect();

            let mut promotion = Promotion::default();
            for score in due {
                let Some(id) = state.delayed.remove(&score) else {
                    continue;
                };
                state.delayed_index.remove(&id);
                match state.jobs.get_mut(&id) {
                    Some(record) => {
                        record.mark_waiting();
                        state.waiting.push_back(id);
                        promotion.promoted += 1;
                    }
                    None => {
                        tracing::error!(queue = %queue, job_id = %id, "Delayed id has no job record; dropped");
                        promotion.orphaned.push(id);
                    }
                }
            }
            promotion
        };

        if promotion.promoted > 0 {
            slot.wake();
        }
        Ok(promotion)
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        now: i64,
        stall_threshold_ms: u64,
        limit: usize,
    ) -> Result<Recovery> {
        let slot = self.slot(queue)?;
        let mut state = slot.state.lock();
        let cutoff = now.saturating_sub(stall_threshold_ms as i64);

        let mut candidates: Vec<(i64, JobId)> = state
            .active
            .iter()
            .map(|id| {
                let claimed = state
                    .jobs
                    .get(id)
                    .and_then(|r| r.processed_at)
                    .unwrap_or(i64::MIN);
                (claimed, id.clone())
            })
            .filter(|(claimed, _)| *claimed < cutoff)
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut recovery = Recovery::default();
        for (_, id) in candidates {
            if !state.jobs.contains_key(&id) {
                state.active.remove(&id);
                tracing::error!(queue = %queue, job_id = %id, "Active id has no job record; cleared");
                recovery.orphaned.push(id);
                continue;
            }
            match state.fail_active(queue, &id, STALLED_REASON, now)? {
                FailOutcome::Retrying { .. } => recovery.retried.push(id),
                FailOutcome::Failed(_) => recovery.failed.push(id),
                FailOutcome::Stale => {}
            }
        }
        Ok(recovery)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>> {
        let slot = self.slot(queue)?;
        let state = slot.state.lock();
        Ok(state.jobs.get(id).cloned())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let slot = self.slot(queue)?;
        let state = slot.state.lock();
        Ok(QueueCounts {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            jobs: state.jobs.len(),
        })
    }

    async fn memberships(&self, queue: &str, id: &JobId) -> Result<Vec<JobStatus>> {
        let slot = self.slot(queue)?;
        let state = slot.state.lock();
        Ok(state.memberships(id))
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription> {
        let slot = self.slot(queue)?;
        // A lagged receiver still means work arrived.
        let stream = BroadcastStream::new(slot.notify.subscribe()).map(|_| ());
        Ok(Subscription::new(stream.boxed()))
    }
}
