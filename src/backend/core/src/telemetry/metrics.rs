//! Queue metrics.
//!
//! Counters and histograms are recorded through the `metrics` facade and are
//! no-ops until the application installs a recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use panqueue_core::telemetry::metrics::QueueMetrics;
//!
//! QueueMetrics::enqueued("emails", false);
//! QueueMetrics::claimed("emails");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

use crate::jobs::store::QueueCounts;

/// Register all metric descriptions.
pub fn describe_metrics() {
    describe_counter!("panqueue_jobs_enqueued_total", "Jobs written by enqueue");
    describe_counter!(
        "panqueue_jobs_deduplicated_total",
        "Enqueue calls that hit an existing job id"
    );
    describe_counter!("panqueue_jobs_claimed_total", "Jobs claimed by consumers");
    describe_counter!("panqueue_jobs_completed_total", "Jobs completed successfully");
    describe_counter!("panqueue_jobs_retried_total", "Failed attempts rescheduled for retry");
    describe_counter!("panqueue_jobs_failed_total", "Jobs failed with no retries left");
    describe_counter!("panqueue_jobs_promoted_total", "Delayed jobs moved to waiting");
    describe_counter!(
        "panqueue_jobs_recovered_total",
        "Stalled active jobs handled by recovery"
    );
    describe_counter!(
        "panqueue_jobs_stale_total",
        "complete/fail calls on jobs that were no longer active"
    );
    describe_counter!("panqueue_errors_total", "Queue errors by code");
    describe_histogram!(
        "panqueue_job_duration_seconds",
        "Handler execution time in seconds"
    );
    describe_gauge!("panqueue_queue_depth", "Jobs per state collection");
}

/// Recording helpers, labelled by queue.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn enqueued(queue: &str, delayed: bool) {
        counter!(
            "panqueue_jobs_enqueued_total",
            "queue" => queue.to_string(),
            "delayed" => delayed.to_string(),
        )
        .increment(1);
    }

    pub fn deduplicated(queue: &str) {
        counter!("panqueue_jobs_deduplicated_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn claimed(queue: &str) {
        counter!("panqueue_jobs_claimed_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn completed(queue: &str) {
        counter!("panqueue_jobs_completed_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn retried(queue: &str) {
        counter!("panqueue_jobs_retried_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn failed(queue: &str) {
        counter!("panqueue_jobs_failed_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn promoted(queue: &str, count: usize) {
        if count > 0 {
            counter!("panqueue_jobs_promoted_total", "queue" => queue.to_string())
                .increment(count as u64);
        }
    }

    pub fn recovered(queue: &str, outcome: &'static str, count: usize) {
        if count > 0 {
            counter!(
                "panqueue_jobs_recovered_total",
                "queue" => queue.to_string(),
                "outcome" => outcome,
            )
            .increment(count as u64);
        }
    }

    pub fn stale(queue: &str, operation: &'static str) {
        counter!(
            "panqueue_jobs_stale_total",
            "queue" => queue.to_string(),
            "operation" => operation,
        )
        .increment(1);
    }

    pub fn job_duration(queue: &str, outcome: &'static str, elapsed: Duration) {
        histogram!(
            "panqueue_job_duration_seconds",
            "queue" => queue.to_string(),
            "outcome" => outcome,
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn depth(queue: &str, counts: &QueueCounts) {
        for (state, value) in [
            ("waiting", counts.waiting),
            ("delayed", counts.delayed),
            ("active", counts.active),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            gauge!(
                "panqueue_queue_depth",
                "queue" => queue.to_string(),
                "state" => state,
            )
            .set(value as f64);
        }
    }
}
