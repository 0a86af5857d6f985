//! Job records, options and the retry state machine.
//!
//! This module provides the data model shared by every backend:
//!
//! - **JobId / Payload**: Opaque identifiers and payloads
//! - **JobStatus**: The five lifecycle states
//! - **Backoff**: Fixed and exponential retry delays
//! - **JobRecord**: The persisted record plus its transition helpers
//!
//! The transition helpers are the single Rust definition of the lifecycle
//! rules. The Lua scripts used by the Redis backend mirror them.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ErrorCode, QueueError, Result};

/// Upper bound for a single backoff delay. Keeps `delay * 2^31` inside `i64`.
pub const MAX_BACKOFF_DELAY_MS: u64 = i32::MAX as u64;

/// Upper bound for an enqueue delay (ten years).
pub const MAX_JOB_DELAY_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

const MAX_BACKOFF_EXPONENT: i64 = 31;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job within its queue.
///
/// Generated ids are UUID v4 strings. Callers may supply their own id to get
/// idempotent enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use a caller-supplied id.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(QueueError::new(ErrorCode::InvalidJobId, "Job id must not be empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque job payload.
///
/// Holds JSON text and is persisted as a JSON string, so no store component
/// ever parses or re-encodes the caller's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(String);

impl Payload {
    /// Serialize a value into a payload.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_string(value)?))
    }

    /// Wrap JSON text after checking it parses.
    pub fn from_json(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        serde_json::from_str::<serde::de::IgnoredAny>(&text)?;
        Ok(Self(text))
    }

    /// Deserialize the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.0)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job. Each status corresponds to exactly one state collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// In the waiting list
    Waiting,
    /// In the delayed sorted set, due at a future time
    Delayed,
    /// Claimed by a consumer
    Active,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Waiting,
        Self::Delayed,
        Self::Active,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    /// Delay before the next attempt, given the number of attempts made so far.
    ///
    /// Exponential: `delay * 2^(attempts - 1)`, exponent clamped to `[0, 31]`.
    pub fn delay_for_attempt(&self, attempts: u32) -> i64 {
        let base = self.delay_ms.min(MAX_BACKOFF_DELAY_MS) as i64;
        match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exponent = (attempts as i64 - 1).clamp(0, MAX_BACKOFF_EXPONENT);
                base.saturating_mul(1_i64 << exponent)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-job options provided at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Idempotency key. A fresh UUID is used when absent.
    pub job_id: Option<String>,
    /// Delay before the job becomes claimable.
    #[serde(default)]
    pub delay_ms: u64,
    /// Retries after the first attempt before moving to failed.
    #[serde(default)]
    pub retries: u32,
    pub backoff: Option<Backoff>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.delay_ms > MAX_JOB_DELAY_MS {
            return Err(QueueError::invalid_options(format!(
                "delay of {} ms exceeds the maximum of {} ms",
                self.delay_ms, MAX_JOB_DELAY_MS
            )));
        }
        if let Some(backoff) = &self.backoff {
            if backoff.delay_ms > MAX_BACKOFF_DELAY_MS {
                return Err(QueueError::invalid_options(format!(
                    "backoff delay of {} ms exceeds the maximum of {} ms",
                    backoff.delay_ms, MAX_BACKOFF_DELAY_MS
                )));
            }
        }
        if matches!(self.job_id.as_deref(), Some("")) {
            return Err(QueueError::new(ErrorCode::InvalidJobId, "Job id must not be empty"));
        }
        Ok(())
    }
}

/// A validated job, ready to be written by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: JobId,
    pub data: Payload,
    pub max_retries: u32,
    pub backoff: Option<Backoff>,
    pub delay_ms: u64,
}

impl NewJob {
    pub fn new(data: Payload, options: &JobOptions) -> Result<Self> {
        options.validate()?;
        let id = match &options.job_id {
            Some(id) => JobId::parse(id.clone())?,
            None => JobId::new(),
        };
        Ok(Self {
            id,
            data,
            max_retries: options.retries,
            backoff: options.backoff,
            delay_ms: options.delay_ms,
        })
    }

    /// Due time when the job is delayed, `None` when it goes straight to waiting.
    pub fn run_at(&self, now: i64) -> Option<i64> {
        (self.delay_ms > 0).then(|| now.saturating_add(self.delay_ms as i64))
    }

    pub fn into_record(self, queue_id: &str, now: i64, seq: u64) -> JobRecord {
        let status = if self.delay_ms > 0 {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        JobRecord {
            id: self.id,
            queue_id: queue_id.to_string(),
            data: self.data,
            status,
            attempts: 0,
            max_retries: self.max_retries,
            backoff: self.backoff,
            created_at: now,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            claimed_by: None,
            seq,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The full job record as persisted in the jobs hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub queue_id: String,
    pub data: Payload,
    pub status: JobStatus,
    /// Number of claims so far.
    pub attempts: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// Unix ms.
    pub created_at: i64,
    /// Unix ms of the latest claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,
    /// Unix ms of the terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Ordering stamp, refreshed whenever the job enters the delayed set.
    #[serde(default)]
    pub seq: u64,
}

impl JobRecord {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// waiting -> active
    pub fn mark_active(&mut self, claimant: &str, now: i64) {
        self.status = JobStatus::Active;
        self.attempts = self.attempts.saturating_add(1);
        self.processed_at = Some(now);
        self.claimed_by = Some(claimant.to_string());
    }

    /// active -> completed
    pub fn mark_completed(&mut self, now: i64) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
    }

    /// Due time of the next attempt, or `None` once the retry budget is spent.
    ///
    /// With no backoff configured the retry is due immediately.
    pub fn retry_due(&self, now: i64) -> Option<i64> {
        if self.attempts > self.max_retries {
            return None;
        }
        let delay = self
            .backoff
            .map(|b| b.delay_for_attempt(self.attempts))
            .unwrap_or(0);
        Some(now.saturating_add(delay))
    }

    /// active -> delayed
    pub fn mark_retrying(&mut self, reason: &str, seq: u64) {
        self.status = JobStatus::Delayed;
        self.failed_reason = Some(reason.to_string());
        self.seq = seq;
    }

    /// active -> failed
    pub fn mark_failed(&mut self, reason: &str, now: i64) {
        self.status = JobStatus::Failed;
        self.failed_reason = Some(reason.to_string());
        self.finished_at = Some(now);
    }

    /// delayed -> waiting
    pub fn mark_waiting(&mut self) {
        self.status = JobStatus::Waiting;
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }

    pub fn processed_at_utc(&self) -> Option<DateTime<Utc>> {
        self.processed_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    pub fn finished_at_utc(&self) -> Option<DateTime<Utc>> {
        self.finished_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a job handler. Its message becomes `failedReason`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }

    /// Text stored as the job's `failedReason`.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<QueueError> for JobError {
    fn from(error: QueueError) -> Self {
        Self {
            message: error.user_message().to_string(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{:#}", error))
    }
}

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;
