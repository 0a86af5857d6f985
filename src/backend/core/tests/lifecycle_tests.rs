//! Job lifecycle tests against the in-memory store.
//!
//! Tests cover:
//! - Exclusive, FIFO claims
//! - Retry exhaustion and backoff schedules
//! - Idempotent enqueue
//! - Delayed promotion, including concurrent promoters
//! - Stale transitions and stall recovery

mod common;

use panqueue_core::jobs::{InMemoryStore, JobOptions, JobQueue};
use std::sync::Arc;

fn queue() -> JobQueue {
    JobQueue::in_memory("lifecycle").unwrap()
}

// ============================================================================
// Shared Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_is_exclusive() {
    common::claim_is_exclusive(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_more_claimers_than_jobs() {
    common::more_claimers_than_jobs(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claims_follow_fifo_order() {
    common::claims_follow_fifo_order(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_stamps_record() {
    common::claim_stamps_record(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retries_exhaust_into_failed() {
    common::retries_exhaust_into_failed(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exponential_backoff_doubles() {
    common::exponential_backoff_doubles(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fixed_backoff_is_constant() {
    common::fixed_backoff_is_constant(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enqueue_is_idempotent() {
    common::enqueue_is_idempotent(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_job_promoted_when_due() {
    common::delayed_job_promoted_when_due(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_promotion_preserves_due_order() {
    common::promotion_preserves_due_order(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_promotion_respects_batch_limit() {
    common::promotion_respects_batch_limit(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_promoters_promote_once() {
    common::concurrent_promoters_promote_once(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_transitions_are_reported() {
    common::stale_transitions_are_reported(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_jobs_are_recovered() {
    common::stalled_jobs_are_recovered(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_in_exactly_one_state() {
    common::every_job_in_exactly_one_state(queue()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inspection_is_consistent_during_transitions() {
    common::inspection_is_consistent_during_transitions(queue()).await;
}

// ============================================================================
// Store Sharing
// ============================================================================

#[tokio::test]
async fn test_queues_on_one_store_are_independent() {
    let store = Arc::new(InMemoryStore::new());
    let emails = JobQueue::new(store.clone(), "emails").unwrap();
    let reports = JobQueue::new(store, "reports").unwrap();

    common::enqueue_at(&emails, JobOptions::new().with_job_id("same"), common::T0).await;
    let other = reports
        .enqueue_at(common::payload(serde_json::json!(null)), JobOptions::new().with_job_id("same"), common::T0)
        .await
        .unwrap();

    // Same id on another queue is a different job.
    assert!(other.is_created());
    assert!(emails.claim_at("w", common::T0).await.unwrap().is_some());
    assert!(emails.claim_at("w", common::T0).await.unwrap().is_none());
    assert_eq!(reports.counts().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn test_invalid_options_create_nothing() {
    let queue = queue();
    let err = queue
        .enqueue(&"x", JobOptions::new().with_delay_ms(u64::MAX))
        .await
        .unwrap_err();
    assert_eq!(err.code(), panqueue_core::ErrorCode::InvalidJobOptions);
    assert_eq!(queue.counts().await.unwrap().jobs, 0);
}
