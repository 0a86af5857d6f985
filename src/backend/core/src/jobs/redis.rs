//! Redis-backed queue store.
//!
//! Every transition is one Lua script receiving only the keys of a single
//! queue, so Redis (and Redis Cluster, thanks to the `{q:<id>}` hash tag)
//! executes it atomically. Replies are flat string arrays tagged by outcome.
//!
//! A stored record that does not decode is never dropped: the scripts park
//! its id in the failed set and report it, and the caller sees an invariant
//! violation.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Script, ScriptInvocation};
use std::time::Duration;
use tracing::error;

use super::connection::{ClientFactory, RedisHandle, StoreConnection};
use super::job::{JobId, JobRecord, JobStatus, NewJob};
use super::keys::QueueKeys;
use super::store::{
    Completion, EnqueueOutcome, FailOutcome, Promotion, QueueCounts, QueueStore, Recovery,
    Subscription, STALLED_REASON,
};
use crate::error::{ErrorCode, QueueError, Result};

const TRANSITIONS_LUA: &str = include_str!("lua/transitions.lua");
const ENQUEUE_LUA: &str = include_str!("lua/enqueue.lua");
const CLAIM_LUA: &str = include_str!("lua/claim.lua");
const COMPLETE_LUA: &str = include_str!("lua/complete.lua");
const FAIL_LUA: &str = include_str!("lua/fail.lua");
const PROMOTE_LUA: &str = include_str!("lua/promote.lua");
const RECOVER_LUA: &str = include_str!("lua/recover.lua");

/// Default bound on opening a pub/sub connection.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

fn with_prelude(body: &str) -> String {
    [TRANSITIONS_LUA, body].concat()
}

/// Script sources, for loading checks.
pub fn script_sources() -> [(&'static str, String); 6] {
    [
        ("enqueue", ENQUEUE_LUA.to_string()),
        ("claim", with_prelude(CLAIM_LUA)),
        ("complete", with_prelude(COMPLETE_LUA)),
        ("fail", with_prelude(FAIL_LUA)),
        ("promote", with_prelude(PROMOTE_LUA)),
        ("recover", with_prelude(RECOVER_LUA)),
    ]
}

struct Scripts {
    enqueue: Script,
    claim: Script,
    complete: Script,
    fail: Script,
    promote: Script,
    recover: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_LUA),
            claim: Script::new(&with_prelude(CLAIM_LUA)),
            complete: Script::new(&with_prelude(COMPLETE_LUA)),
            fail: Script::new(&with_prelude(FAIL_LUA)),
            promote: Script::new(&with_prelude(PROMOTE_LUA)),
            recover: Script::new(&with_prelude(RECOVER_LUA)),
        }
    }
}

/// [`QueueStore`] over Redis.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    scripts: Scripts,
    subscribe_timeout: Duration,
}

impl RedisStore {
    pub fn new(handle: RedisHandle) -> Self {
        Self {
            client: handle.client,
            conn: handle.manager,
            scripts: Scripts::load(),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
        }
    }

    /// Bound on connecting and subscribing in [`QueueStore::subscribe`].
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Build a store from a connected [`StoreConnection`].
    pub fn from_connection<F>(connection: &StoreConnection<F>) -> Result<Self>
    where
        F: ClientFactory<Client = RedisHandle>,
    {
        Ok(Self::new(connection.client()?))
    }

    fn keys(queue: &str) -> Result<QueueKeys> {
        QueueKeys::new(queue)
    }

    /// Attach the queue's keys in the order every script expects.
    fn invocation<'a>(script: &'a Script, keys: &QueueKeys) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.completed)
            .key(&keys.failed)
            .key(&keys.delayed)
            .key(&keys.jobs)
            .key(&keys.meta);
        invocation
    }

    async fn run(&self, invocation: &ScriptInvocation<'_>) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(invocation.invoke_async(&mut conn).await?)
    }
}

fn unexpected_reply(script: &str, reply: &[&str]) -> QueueError {
    QueueError::with_internal(
        ErrorCode::StoreCommandError,
        "Unexpected reply from queue script",
        format!("{}: {:?}", script, reply),
    )
}

fn corrupt_record(queue: &str, id: &str) -> QueueError {
    QueueError::invariant_violation(
        queue,
        id,
        "job record could not be decoded; id moved to failed",
    )
}

fn parse_due(script: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>().map_err(|_| unexpected_reply(script, &[raw]))
}

#[async_trait]
impl QueueStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, queue: &str, job: NewJob, now: i64) -> Result<EnqueueOutcome> {
        let keys = Self::keys(queue)?;
        let run_at = job.run_at(now).map(|due| due.to_string()).unwrap_or_default();
        let id = job.id.clone();
        let raw = job.into_record(queue, now, 0).to_json()?;

        let mut invocation = Self::invocation(&self.scripts.enqueue, &keys);
        invocation
            .arg(&keys.notify)
            .arg(id.as_str())
            .arg(raw)
            .arg(run_at)
            .arg(now);
        let reply = self.run(&invocation).await?;

        let parts: Vec<&str> = reply.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["created", json] => Ok(EnqueueOutcome::Created(JobRecord::from_json(json)?)),
            ["exists", json] => Ok(EnqueueOutcome::Existing(JobRecord::from_json(json)?)),
            other => Err(unexpected_reply("enqueue", other)),
        }
    }

    async fn claim(&self, queue: &str, claimant: &str, now: i64) -> Result<Option<JobRecord>> {
        let keys = Self::keys(queue)?;
        let mut invocation = Self::invocation(&self.scripts.claim, &keys);
        invocation.arg(claimant).arg(now);
        let reply = self.run(&invocation).await?;

        let parts: Vec<&str> = reply.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["empty"] => Ok(None),
            ["ok", json] => Ok(Some(JobRecord::from_json(json)?)),
            ["missing", id] => Err(QueueError::invariant_violation(
                queue,
                id,
                "waiting id has no job record",
            )),
            ["corrupt", id] => Err(corrupt_record(queue, id)),
            other => Err(unexpected_reply("claim", other)),
        }
    }

    async fn complete(&self, queue: &str, id: &JobId, now: i64) -> Result<Completion> {
        let keys = Self::keys(queue)?;
        let mut invocation = Self::invocation(&self.scripts.complete, &keys);
        invocation.arg(id.as_str()).arg(now);
        let reply = self.run(&invocation).await?;

        let parts: Vec<&str> = reply.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["stale"] => Ok(Completion::Stale),
            ["ok", json] => Ok(Completion::Completed(JobRecord::from_json(json)?)),
            ["missing", id] => Err(QueueError::invariant_violation(
                queue,
                id,
                "active id has no job record",
            )),
            ["corrupt", id] => Err(corrupt_record(queue, id)),
            other => Err(unexpected_reply("complete", other)),
        }
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str, now: i64) -> Result<FailOutcome> {
        let keys = Self::keys(queue)?;
        let mut invocation = Self::invocation(&self.scripts.fail, &keys);
        invocation.arg(id.as_str()).arg(reason).arg(now);
        let reply = self.run(&invocation).await?;

        let parts: Vec<&str> = reply.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["stale"] => Ok(FailOutcome::Stale),
            ["retry", json, due] => Ok(FailOutcome::Retrying {
                record: JobRecord::from_json(json)?,
                due_at: parse_due("fail", due)?,
            }),
            ["failed", json] => Ok(FailOutcome::Failed(JobRecord::from_json(json)?)),
            ["missing", id] => Err(QueueError::invariant_violation(
                queue,
                id,
                "active id has no job record",
            )),
            ["corrupt", id] => Err(corrupt_record(queue, id)),
            other => Err(unexpected_reply("fail", other)),
        }
    }

    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Promotion> {
        if limit == 0 {
            return Ok(Promotion::default());
        }
        let keys = Self::keys(queue)?;
        let mut invocation = Self::invocation(&self.scripts.promote, &keys);
        invocation.arg(&keys.notify).arg(now).arg(limit);
        let reply = self.run(&invocation).await?;

        let Some((count, skipped)) = reply.split_first() else {
            return Err(unexpected_reply("promote", &[]));
        };
        let promoted = count
            .parse::<usize>()
            .map_err(|_| unexpected_reply("promote", &[count.as_str()]))?;
        if skipped.len() % 2 != 0 {
            let parts: Vec<&str> = reply.iter().map(String::as_str).collect();
            return Err(unexpected_reply("promote", &parts));
        }

        let mut promotion = Promotion {
            promoted,
            ..Default::default()
        };
        for pair in skipped.chunks_exact(2) {
            let id = JobId::parse(pair[1].clone())?;
            match pair[0].as_str() {
                "orphaned" => {
                    error!(queue = %queue, job_id = %id, "Delayed id has no job record; dropped");
                    promotion.orphaned.push(id);
                }
                "corrupt" => {
                    error!(queue = %queue, job_id = %id, "Delayed job record is corrupt; moved to failed");
                    promotion.corrupt.push(id);
                }
                other => return Err(unexpected_reply("promote", &[other])),
            }
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
        let keys = Self::keys(queue)?;
        let cutoff = now.saturating_sub(stall_threshold_ms as i64);
        let mut invocation = Self::invocation(&self.scripts.recover, &keys);
        invocation
            .arg(now)
            .arg(cutoff)
            .arg(limit)
            .arg(STALLED_REASON);
        let reply = self.run(&invocation).await?;

        if reply.len() % 2 != 0 {
            let parts: Vec<&str> = reply.iter().map(String::as_str).collect();
            return Err(unexpected_reply("recover", &parts));
        }

        let mut recovery = Recovery::default();
        for pair in reply.chunks_exact(2) {
            let id = JobId::parse(pair[1].clone())?;
            match pair[0].as_str() {
                "retry" => recovery.retried.push(id),
                "failed" => recovery.failed.push(id),
                "orphaned" => {
                    error!(queue = %queue, job_id = %id, "Active id has no job record; cleared");
                    recovery.orphaned.push(id);
                }
                "corrupt" => {
                    error!(queue = %queue, job_id = %id, "Active job record is corrupt; moved to failed");
                    recovery.corrupt.push(id);
                }
                other => return Err(unexpected_reply("recover", &[other])),
            }
        }
        Ok(recovery)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>> {
        let keys = Self::keys(queue)?;
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&keys.jobs)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        raw.as_deref().map(JobRecord::from_json).transpose()
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let keys = Self::keys(queue)?;
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed, jobs): (usize, usize, usize, usize, usize, usize) =
            redis::pipe()
                .atomic()
                .cmd("LLEN").arg(&keys.waiting)
                .cmd("ZCARD").arg(&keys.delayed)
                .cmd("SCARD").arg(&keys.active)
                .cmd("SCARD").arg(&keys.completed)
                .cmd("SCARD").arg(&keys.failed)
                .cmd("HLEN").arg(&keys.jobs)
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
            jobs,
        })
    }

    async fn memberships(&self, queue: &str, id: &JobId) -> Result<Vec<JobStatus>> {
        let keys = Self::keys(queue)?;
        let mut conn = self.conn.clone();
        let (waiting_pos, delayed_score, active, completed, failed): (
            Option<i64>,
            Option<f64>,
            bool,
            bool,
            bool,
        ) = redis::pipe()
            .atomic()
            .cmd("LPOS").arg(&keys.waiting).arg(id.as_str())
            .cmd("ZSCORE").arg(&keys.delayed).arg(id.as_str())
            .cmd("SISMEMBER").arg(&keys.active).arg(id.as_str())
            .cmd("SISMEMBER").arg(&keys.completed).arg(id.as_str())
            .cmd("SISMEMBER").arg(&keys.failed).arg(id.as_str())
            .query_async(&mut conn)
            .await?;

        let found = [
            (waiting_pos.is_some(), JobStatus::Waiting),
            (delayed_score.is_some(), JobStatus::Delayed),
            (active, JobStatus::Active),
            (completed, JobStatus::Completed),
            (failed, JobStatus::Failed),
        ];
        Ok(found
            .into_iter()
            .filter_map(|(present, status)| present.then_some(status))
            .collect())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription> {
        let keys = Self::keys(queue)?;
        let pubsub = tokio::time::timeout(self.subscribe_timeout, async {
            // Dedicated connection: a subscribed connection cannot issue commands.
            let conn = self.client.get_async_connection().await?;
            let mut pubsub = conn.into_pubsub();
            pubsub.subscribe(&keys.notify).await?;
            Ok::<_, QueueError>(pubsub)
        })
        .await??;
        let stream = pubsub.into_on_message().map(|_| ());
        Ok(Subscription::new(stream.boxed()))
    }
}
