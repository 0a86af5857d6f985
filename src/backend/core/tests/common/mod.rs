//! Lifecycle scenarios shared by the in-memory and Redis test suites.
//!
//! Every scenario drives the queue with an explicit clock, so both backends
//! see identical timestamps.

#![allow(dead_code)]

use panqueue_core::jobs::{
    Backoff, Completion, FailOutcome, JobId, JobOptions, JobQueue, JobStatus, Payload,
};
use std::collections::HashSet;

/// Fixed epoch used as "now" by the scenarios.
pub const T0: i64 = 1_700_000_000_000;

pub fn payload(value: serde_json::Value) -> Payload {
    Payload::from_value(&value).unwrap()
}

pub async fn enqueue_at(queue: &JobQueue, options: JobOptions, now: i64) -> JobId {
    queue
        .enqueue_at(payload(serde_json::json!({ "n": 1 })), options, now)
        .await
        .unwrap()
        .id()
        .clone()
}

pub async fn assert_single_membership(queue: &JobQueue, id: &JobId, expected: JobStatus) {
    let found = queue.memberships(id).await.unwrap();
    assert_eq!(found, vec![expected], "job {} memberships", id);
    let record = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(record.status, expected, "job {} status", id);
}

// ============================================================================
// Scenarios
// ============================================================================

pub async fn claim_is_exclusive(queue: JobQueue) {
    const JOBS: usize = 40;
    const CLAIMERS: usize = 8;

    for _ in 0..JOBS {
        enqueue_at(&queue, JobOptions::new(), T0).await;
    }

    let mut tasks = Vec::new();
    for worker in 0..CLAIMERS {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let claimant = format!("claimer-{}", worker);
            let mut claimed = Vec::new();
            while let Some(job) = queue.claim_at(&claimant, T0 + 1).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    let distinct: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), JOBS);
    assert_eq!(distinct.len(), JOBS);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.active, JOBS);
}

pub async fn more_claimers_than_jobs(queue: JobQueue) {
    for _ in 0..3 {
        enqueue_at(&queue, JobOptions::new(), T0).await;
    }

    let mut tasks = Vec::new();
    for worker in 0..10 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue.claim_at(&format!("c{}", worker), T0).await.unwrap()
        }));
    }

    let mut ids = HashSet::new();
    let mut empty = 0;
    for task in tasks {
        match task.await.unwrap() {
            Some(job) => assert!(ids.insert(job.id)),
            None => empty += 1,
        }
    }
    assert_eq!(ids.len(), 3);
    assert_eq!(empty, 7);
}

pub async fn claims_follow_fifo_order(queue: JobQueue) {
    let a = enqueue_at(&queue, JobOptions::new().with_job_id("A"), T0).await;
    let b = enqueue_at(&queue, JobOptions::new().with_job_id("B"), T0).await;
    let c = enqueue_at(&queue, JobOptions::new().with_job_id("C").with_delay_ms(1000), T0).await;

    let first = queue.claim_at("w", T0).await.unwrap().unwrap();
    let second = queue.claim_at("w", T0).await.unwrap().unwrap();
    assert_eq!(first.id, a);
    assert_eq!(second.id, b);

    // C exists but is not due yet.
    assert!(queue.claim_at("w", T0).await.unwrap().is_none());
    assert_single_membership(&queue, &c, JobStatus::Delayed).await;

    let promoted = queue.promote_delayed_at(T0 + 1000, 10).await.unwrap();
    assert_eq!(promoted.promoted, 1);
    assert_eq!(queue.claim_at("w", T0 + 1000).await.unwrap().unwrap().id, c);
}

pub async fn claim_stamps_record(queue: JobQueue) {
    let id = enqueue_at(&queue, JobOptions::new().with_retries(1), T0).await;
    let job = queue.claim_at("worker-7", T0 + 5).await.unwrap().unwrap();

    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.processed_at, Some(T0 + 5));
    assert_eq!(job.claimed_by.as_deref(), Some("worker-7"));
    assert_eq!(job.data.decode::<serde_json::Value>().unwrap()["n"], 1);

    match queue.complete_at(&id, T0 + 9).await.unwrap() {
        Completion::Completed(record) => {
            assert_eq!(record.status, JobStatus::Completed);
            assert_eq!(record.finished_at, Some(T0 + 9));
        }
        Completion::Stale => panic!("expected completion"),
    }
    assert_single_membership(&queue, &id, JobStatus::Completed).await;
}

pub async fn retries_exhaust_into_failed(queue: JobQueue) {
    let id = enqueue_at(&queue, JobOptions::new().with_retries(2), T0).await;
    let mut now = T0;

    for attempt in 1..=2 {
        let job = queue.claim_at("w", now).await.unwrap().unwrap();
        assert_eq!(job.attempts, attempt);
        match queue.fail_at(&id, "boom", now).await.unwrap() {
            FailOutcome::Retrying { record, due_at } => {
                // No backoff: due immediately, still routed through delayed.
                assert_eq!(due_at, now);
                assert_eq!(record.status, JobStatus::Delayed);
                assert_eq!(record.failed_reason.as_deref(), Some("boom"));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert_single_membership(&queue, &id, JobStatus::Delayed).await;
        assert_eq!(queue.promote_delayed_at(now, 10).await.unwrap().promoted, 1);
        now += 10;
    }

    let job = queue.claim_at("w", now).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    match queue.fail_at(&id, "final", now).await.unwrap() {
        FailOutcome::Failed(record) => {
            assert_eq!(record.status, JobStatus::Failed);
            assert_eq!(record.attempts, 3);
            assert_eq!(record.failed_reason.as_deref(), Some("final"));
            assert_eq!(record.finished_at, Some(now));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_single_membership(&queue, &id, JobStatus::Failed).await;

    // Terminal: nothing re-enters the lifecycle.
    assert_eq!(queue.fail_at(&id, "again", now).await.unwrap(), FailOutcome::Stale);
    assert_eq!(queue.complete_at(&id, now).await.unwrap(), Completion::Stale);
    assert!(queue.claim_at("w", now).await.unwrap().is_none());
}

pub async fn exponential_backoff_doubles(queue: JobQueue) {
    let id = enqueue_at(
        &queue,
        JobOptions::new()
            .with_retries(3)
            .with_backoff(Backoff::exponential(100)),
        T0,
    )
    .await;

    let mut now = T0;
    for expected in [100, 200, 400] {
        queue.claim_at("w", now).await.unwrap().unwrap();
        let due_at = match queue.fail_at(&id, "retry me", now).await.unwrap() {
            FailOutcome::Retrying { due_at, .. } => due_at,
            other => panic!("expected retry, got {:?}", other),
        };
        assert_eq!(due_at - now, expected);

        // Not due one millisecond early.
        let early = queue.promote_delayed_at(due_at - 1, 10).await.unwrap();
        assert_eq!(early.promoted, 0);
        assert!(queue.claim_at("w", due_at - 1).await.unwrap().is_none());

        assert_eq!(queue.promote_delayed_at(due_at, 10).await.unwrap().promoted, 1);
        now = due_at;
    }

    queue.claim_at("w", now).await.unwrap().unwrap();
    assert!(matches!(
        queue.fail_at(&id, "done", now).await.unwrap(),
        FailOutcome::Failed(_)
    ));
}

pub async fn fixed_backoff_is_constant(queue: JobQueue) {
    let id = enqueue_at(
        &queue,
        JobOptions::new().with_retries(2).with_backoff(Backoff::fixed(250)),
        T0,
    )
    .await;

    let mut now = T0;
    for _ in 0..2 {
        queue.claim_at("w", now).await.unwrap().unwrap();
        let FailOutcome::Retrying { due_at, .. } = queue.fail_at(&id, "x", now).await.unwrap() else {
            panic!("expected retry");
        };
        assert_eq!(due_at - now, 250);
        queue.promote_delayed_at(due_at, 10).await.unwrap();
        now = due_at;
    }
}

pub async fn enqueue_is_idempotent(queue: JobQueue) {
    let first = queue
        .enqueue_at(
            payload(serde_json::json!({ "v": 1 })),
            JobOptions::new().with_job_id("dedup"),
            T0,
        )
        .await
        .unwrap();
    assert!(first.is_created());

    let second = queue
        .enqueue_at(
            payload(serde_json::json!({ "v": 2 })),
            JobOptions::new().with_job_id("dedup").with_delay_ms(500),
            T0 + 1,
        )
        .await
        .unwrap();
    assert!(!second.is_created());
    assert_eq!(second.record(), first.record());

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.jobs, 1);
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.delayed, 0);

    // A terminal record is returned unchanged as well.
    let id = first.id().clone();
    queue.claim_at("w", T0 + 2).await.unwrap().unwrap();
    queue.complete_at(&id, T0 + 3).await.unwrap();

    let third = queue
        .enqueue_at(
            payload(serde_json::json!({ "v": 3 })),
            JobOptions::new().with_job_id("dedup"),
            T0 + 4,
        )
        .await
        .unwrap();
    let record = third.into_record();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.data.decode::<serde_json::Value>().unwrap()["v"], 1);
    assert_single_membership(&queue, &id, JobStatus::Completed).await;
}

pub async fn delayed_job_promoted_when_due(queue: JobQueue) {
    let id = enqueue_at(&queue, JobOptions::new().with_delay_ms(50), T0).await;

    assert_single_membership(&queue, &id, JobStatus::Delayed).await;
    assert!(queue.claim_at("w", T0).await.unwrap().is_none());
    assert_eq!(queue.promote_delayed_at(T0 + 49, 10).await.unwrap().promoted, 0);

    let promotion = queue.promote_delayed_at(T0 + 60, 10).await.unwrap();
    assert_eq!(promotion.promoted, 1);
    assert!(promotion.orphaned.is_empty());
    assert_single_membership(&queue, &id, JobStatus::Waiting).await;

    // Promoting again finds nothing.
    assert_eq!(queue.promote_delayed_at(T0 + 70, 10).await.unwrap().promoted, 0);
}

pub async fn promotion_preserves_due_order(queue: JobQueue) {
    let late = enqueue_at(&queue, JobOptions::new().with_delay_ms(30), T0).await;
    let early = enqueue_at(&queue, JobOptions::new().with_delay_ms(10), T0).await;
    let tie_a = enqueue_at(&queue, JobOptions::new().with_delay_ms(20), T0).await;
    let tie_b = enqueue_at(&queue, JobOptions::new().with_delay_ms(20), T0).await;

    assert_eq!(queue.promote_delayed_at(T0 + 100, 10).await.unwrap().promoted, 4);

    let mut order = Vec::new();
    while let Some(job) = queue.claim_at("w", T0 + 100).await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![early, tie_a, tie_b, late]);
}

pub async fn promotion_respects_batch_limit(queue: JobQueue) {
    for _ in 0..5 {
        enqueue_at(&queue, JobOptions::new().with_delay_ms(1), T0).await;
    }
    assert_eq!(queue.promote_delayed_at(T0 + 1, 2).await.unwrap().promoted, 2);
    assert_eq!(queue.promote_delayed_at(T0 + 1, 2).await.unwrap().promoted, 2);
    assert_eq!(queue.promote_delayed_at(T0 + 1, 2).await.unwrap().promoted, 1);
    assert_eq!(queue.counts().await.unwrap().waiting, 5);
}

pub async fn concurrent_promoters_promote_once(queue: JobQueue) {
    const JOBS: usize = 30;
    for _ in 0..JOBS {
        enqueue_at(&queue, JobOptions::new().with_delay_ms(50), T0).await;
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut promoted = 0;
            loop {
                let pass = queue.promote_delayed_at(T0 + 60, 4).await.unwrap();
                if pass.promoted == 0 {
                    return promoted;
                }
                promoted += pass.promoted;
            }
        }));
    }

    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }
    assert_eq!(total, JOBS);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.waiting, JOBS);
    assert_eq!(counts.delayed, 0);
}

pub async fn stale_transitions_are_reported(queue: JobQueue) {
    let id = enqueue_at(&queue, JobOptions::new(), T0).await;

    // Waiting, not active.
    assert_eq!(queue.complete_at(&id, T0).await.unwrap(), Completion::Stale);
    assert_eq!(queue.fail_at(&id, "x", T0).await.unwrap(), FailOutcome::Stale);
    assert_single_membership(&queue, &id, JobStatus::Waiting).await;

    queue.claim_at("w", T0).await.unwrap().unwrap();
    assert!(matches!(
        queue.complete_at(&id, T0).await.unwrap(),
        Completion::Completed(_)
    ));
    assert_eq!(queue.complete_at(&id, T0).await.unwrap(), Completion::Stale);
}

pub async fn stalled_jobs_are_recovered(queue: JobQueue) {
    let retried = enqueue_at(&queue, JobOptions::new().with_retries(1), T0).await;
    let exhausted = enqueue_at(&queue, JobOptions::new(), T0).await;
    let fresh = enqueue_at(&queue, JobOptions::new().with_retries(1), T0).await;

    queue.claim_at("crashed", T0).await.unwrap().unwrap();
    queue.claim_at("crashed", T0).await.unwrap().unwrap();
    queue.claim_at("alive", T0 + 900).await.unwrap().unwrap();

    let recovery = queue.recover_stalled_at(T0 + 1000, 500, 100).await.unwrap();
    assert_eq!(recovery.retried, vec![retried.clone()]);
    assert_eq!(recovery.failed, vec![exhausted.clone()]);
    assert!(recovery.orphaned.is_empty());

    assert_single_membership(&queue, &retried, JobStatus::Delayed).await;
    assert_single_membership(&queue, &exhausted, JobStatus::Failed).await;
    assert_single_membership(&queue, &fresh, JobStatus::Active).await;

    let failed = queue.get_job(&exhausted).await.unwrap().unwrap();
    assert!(failed.failed_reason.unwrap().contains("stalled"));

    // A second pass finds nothing new.
    let again = queue.recover_stalled_at(T0 + 1000, 500, 100).await.unwrap();
    assert_eq!(again.total(), 0);
}

pub async fn every_job_in_exactly_one_state(queue: JobQueue) {
    let mut ids = Vec::new();
    for i in 0..6 {
        let delay = if i % 2 == 0 { 0 } else { 100 };
        ids.push(enqueue_at(&queue, JobOptions::new().with_retries(1).with_delay_ms(delay), T0).await);
    }

    let a = queue.claim_at("w", T0).await.unwrap().unwrap();
    let b = queue.claim_at("w", T0).await.unwrap().unwrap();
    queue.complete_at(&a.id, T0 + 1).await.unwrap();
    queue.fail_at(&b.id, "oops", T0 + 1).await.unwrap();
    queue.promote_delayed_at(T0 + 100, 1).await.unwrap();

    for id in &ids {
        let found = queue.memberships(id).await.unwrap();
        assert_eq!(found.len(), 1, "job {} in {:?}", id, found);
    }

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.total_members(), counts.jobs);
    assert_eq!(counts.jobs, 6);
}

pub async fn inspection_is_consistent_during_transitions(queue: JobQueue) {
    const JOBS: usize = 30;

    let mut ids = Vec::new();
    for _ in 0..JOBS {
        ids.push(enqueue_at(&queue, JobOptions::new().with_delay_ms(1000), T0).await);
    }

    let mover = {
        let queue = queue.clone();
        tokio::spawn(async move {
            // One job per call, so the observer sees every intermediate step.
            while queue.promote_delayed_at(T0 + 2000, 1).await.unwrap().promoted == 1 {
                if let Some(job) = queue.claim_at("mover", T0 + 2000).await.unwrap() {
                    queue.complete_at(&job.id, T0 + 2001).await.unwrap();
                }
            }
        })
    };

    while !mover.is_finished() {
        for id in &ids {
            let found = queue.memberships(id).await.unwrap();
            assert_eq!(found.len(), 1, "job {} memberships {:?}", id, found);
        }
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.total_members(), counts.jobs, "{:?}", counts);
    }
    mover.await.unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, JOBS);
}
