//! Key namespace for queue state.
//!
//! Every key of a queue embeds the hash tag `{q:<queueId>}` so that a Redis
//! Cluster router sends all of them to the same slot. A script may then touch
//! all of a queue's keys in one atomic step. No key ever spans two queues.

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

const WAITING: &str = "waiting";
const ACTIVE: &str = "active";
const COMPLETED: &str = "completed";
const FAILED: &str = "failed";
const DELAYED: &str = "delayed";
const JOBS: &str = "jobs";
const META: &str = "meta";
const NOTIFY: &str = "notify";

/// Build the key for `suffix` inside the namespace of `queue_id`.
pub fn queue_key(queue_id: &str, suffix: &str) -> String {
    format!("{{q:{}}}:{}", queue_id, suffix)
}

/// Reject queue ids that would break hash-tag routing.
pub fn validate_queue_id(queue_id: &str) -> Result<()> {
    if queue_id.is_empty() {
        return Err(QueueError::invalid_queue_id(queue_id, "must not be empty"));
    }
    if queue_id.contains(['{', '}']) {
        return Err(QueueError::invalid_queue_id(
            queue_id,
            "must not contain '{' or '}'",
        ));
    }
    if queue_id.chars().any(char::is_whitespace) {
        return Err(QueueError::invalid_queue_id(
            queue_id,
            "must not contain whitespace",
        ));
    }
    Ok(())
}

/// Extract the routing tag of a key the way a cluster router does: the text
/// between the first `{` and the next `}`, if non-empty.
pub fn hash_tag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let rest = &key[open + 1..];
    let close = rest.find('}')?;
    if close == 0 {
        return None;
    }
    Some(&rest[..close])
}

/// All keys belonging to one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueKeys {
    pub queue_id: String,
    /// List of job ids, FIFO.
    pub waiting: String,
    /// Set of claimed, unfinished job ids.
    pub active: String,
    pub completed: String,
    pub failed: String,
    /// Sorted set of job ids scored by due time (ms).
    pub delayed: String,
    /// Hash of job id to serialized record.
    pub jobs: String,
    /// Hash of queue metadata (sequence counter, creation time).
    pub meta: String,
    /// Pub/sub channel used as a wake-up hint.
    pub notify: String,
}

impl QueueKeys {
    pub fn new(queue_id: impl Into<String>) -> Result<Self> {
        let queue_id = queue_id.into();
        validate_queue_id(&queue_id)?;
        Ok(Self {
            waiting: queue_key(&queue_id, WAITING),
            active: queue_key(&queue_id, ACTIVE),
            completed: queue_key(&queue_id, COMPLETED),
            failed: queue_key(&queue_id, FAILED),
            delayed: queue_key(&queue_id, DELAYED),
            jobs: queue_key(&queue_id, JOBS),
            meta: queue_key(&queue_id, META),
            notify: queue_key(&queue_id, NOTIFY),
            queue_id,
        })
    }

    /// Every key, in a stable order.
    pub fn all(&self) -> [&str; 8] {
        [
            &self.waiting,
            &self.active,
            &self.completed,
            &self.failed,
            &self.delayed,
            &self.jobs,
            &self.meta,
            &self.notify,
        ]
    }
}
