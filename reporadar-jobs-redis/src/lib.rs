//! A Redis implementation of [`reporadar_jobs::backend::Backend`].
//!
//! Jobs are stored as one hash per job under `{namespace}:job:{id}`, with a
//! monotonic id counter and three sorted sets tracking lifecycle membership:
//!
//! - `{namespace}:ready` scored by `scheduled_at`, holding claimable jobs,
//! - `{namespace}:processing` scored by `attempted_at`, holding live claims
//!   so stale ones can be found after a crash, and
//! - `{namespace}:done` scored by `completed_at`, holding terminal jobs for
//!   retention-based cleanup.
//!
//! All state transitions run as Lua scripts so that claiming and the
//! guarded `processing -> terminal` transitions are atomic even with many
//! application instances sharing one Redis.
//!
//! # Example
//!
//! ```no_run
//! # use reporadar_jobs::prelude::*;
//! # use reporadar_jobs_redis::RedisBackend;
//! # async fn example() -> Result<(), QueueError> {
//! let backend = RedisBackend::from_url("redis://127.0.0.1", "reporadar").await?;
//! let queue = JobQueue::connect(backend, QueueConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

use std::{collections::HashMap, ops::Sub, pin::Pin, str::FromStr, sync::Arc, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script, ToRedisArgs};
use reporadar_jobs::{
    backend::{Backend, BackendError, EnqueuableJob, ExecutionError, Job, QueueStats},
    job::{ErrorKind, JobId, JobStatus},
};

/// How many due jobs the claim script inspects when picking the highest
/// priority one. Due jobs beyond this window are claimed on a later pass, so
/// priority ordering is best-effort under heavy backlog.
const CLAIM_WINDOW: usize = 16;

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
if #due == 0 then
    return false
end
local best, best_priority, best_id
for _, id in ipairs(due) do
    local priority = tonumber(redis.call('HGET', ARGV[2] .. id, 'priority')) or 0
    local numeric = tonumber(id)
    if best == nil
        or priority > best_priority
        or (priority == best_priority and numeric < best_id) then
        best, best_priority, best_id = id, priority, numeric
    end
end
local key = ARGV[2] .. best
local attempt = (tonumber(redis.call('HGET', key, 'attempt')) or 0) + 1
redis.call('HSET', key, 'status', 'processing', 'attempt', attempt, 'attempted_at', ARGV[1])
if redis.call('HEXISTS', key, 'started_at') == 0 then
    redis.call('HSET', key, 'started_at', ARGV[1])
end
redis.call('ZREM', KEYS[1], best)
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]), best)
return redis.call('HGETALL', key)
"#;

const COMPLETE_SCRIPT: &str = r#"
local key = ARGV[2] .. ARGV[1]
if redis.call('EXISTS', key) == 0 then
    return -1
end
if redis.call('HGET', key, 'status') ~= 'processing' then
    return 0
end
redis.call('HSET', key, 'status', 'completed', 'progress', 100, 'result', ARGV[4], 'completed_at', ARGV[3])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const RETRY_SCRIPT: &str = r#"
local key = ARGV[2] .. ARGV[1]
if redis.call('EXISTS', key) == 0 then
    return -1
end
if redis.call('HGET', key, 'status') ~= 'processing' then
    return 0
end
local raw = redis.call('HGET', key, 'errors')
if raw == false then
    raw = '[]'
end
local errors = cjson.decode(raw)
table.insert(errors, cjson.decode(ARGV[4]))
redis.call('HSET', key, 'status', 'queued', 'scheduled_at', ARGV[3], 'errors', cjson.encode(errors))
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
local key = ARGV[2] .. ARGV[1]
if redis.call('EXISTS', key) == 0 then
    return -1
end
if redis.call('HGET', key, 'status') ~= 'processing' then
    return 0
end
local raw = redis.call('HGET', key, 'errors')
if raw == false then
    raw = '[]'
end
local errors = cjson.decode(raw)
table.insert(errors, cjson.decode(ARGV[4]))
redis.call('HSET', key, 'status', 'failed', 'completed_at', ARGV[3], 'errors', cjson.encode(errors))
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const CANCEL_SCRIPT: &str = r#"
local key = ARGV[2] .. ARGV[1]
if redis.call('EXISTS', key) == 0 then
    return -1
end
local status = redis.call('HGET', key, 'status')
if status == 'completed' or status == 'failed' or status == 'cancelled' then
    return 0
end
redis.call('HSET', key, 'status', 'cancelled', 'completed_at', ARGV[3])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const PROGRESS_SCRIPT: &str = r#"
local key = ARGV[2] .. ARGV[1]
if redis.call('EXISTS', key) == 0 then
    return -1
end
if redis.call('HGET', key, 'status') ~= 'processing' then
    return -2
end
local current = tonumber(redis.call('HGET', key, 'progress')) or 0
local new = tonumber(ARGV[3])
if new < current then
    return -3
end
redis.call('HSET', key, 'progress', new)
return 1
"#;

const RECOVER_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local recovered = 0
for _, id in ipairs(stale) do
    local key = ARGV[3] .. id
    if redis.call('HGET', key, 'status') == 'processing' then
        local attempt = tonumber(redis.call('HGET', key, 'attempt')) or 0
        local max_attempts = tonumber(redis.call('HGET', key, 'max_attempts')) or 1
        local raw = redis.call('HGET', key, 'errors')
        if raw == false then
            raw = '[]'
        end
        local errors = cjson.decode(raw)
        local err = cjson.decode(ARGV[4])
        err['attempt'] = attempt
        table.insert(errors, err)
        if attempt < max_attempts then
            redis.call('HSET', key, 'status', 'queued', 'scheduled_at', ARGV[2], 'errors', cjson.encode(errors))
            redis.call('ZADD', KEYS[2], tonumber(ARGV[2]), id)
        else
            redis.call('HSET', key, 'status', 'failed', 'completed_at', ARGV[2], 'errors', cjson.encode(errors))
            redis.call('ZADD', KEYS[3], tonumber(ARGV[2]), id)
        end
        recovered = recovered + 1
    end
    redis.call('ZREM', KEYS[1], id)
end
return recovered
"#;

const PRUNE_SCRIPT: &str = r#"
local old = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(old) do
    redis.call('DEL', ARGV[2] .. id)
    redis.call('ZREM', KEYS[2], id)
end
if #old > 0 then
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return #old
"#;

const STATS_SCRIPT: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
local now = tonumber(ARGV[1])
local waiting, active, completed, failed, delayed = 0, 0, 0, 0, 0
for _, id in ipairs(ids) do
    local key = ARGV[2] .. id
    local status = redis.call('HGET', key, 'status')
    if status == 'queued' then
        local at = tonumber(redis.call('HGET', key, 'scheduled_at')) or 0
        if at <= now then
            waiting = waiting + 1
        else
            delayed = delayed + 1
        end
    elseif status == 'processing' then
        active = active + 1
    elseif status == 'completed' then
        completed = completed + 1
    elseif status == 'failed' then
        failed = failed + 1
    end
end
return {waiting, active, completed, failed, delayed}
"#;

struct Scripts {
    claim: Script,
    complete: Script,
    retry: Script,
    fail: Script,
    cancel: Script,
    progress: Script,
    recover: Script,
    prune: Script,
    stats: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            cancel: Script::new(CANCEL_SCRIPT),
            progress: Script::new(PROGRESS_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
            prune: Script::new(PRUNE_SCRIPT),
            stats: Script::new(STATS_SCRIPT),
        }
    }
}

/// A [`Backend`] storing jobs in Redis.
///
/// Cloning is cheap and clones share the underlying connection manager.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: NameSpace,
    scripts: Arc<Scripts>,
}

fn map_err(error: RedisError) -> BackendError {
    BackendError::Connection(error.to_string())
}

impl RedisBackend {
    /// Connect to the Redis instance at `redis_url`, storing jobs under the
    /// given key namespace.
    ///
    /// Multiple application instances sharing a queue must use the same
    /// namespace; distinct queues on one Redis must use distinct namespaces.
    pub async fn from_url(redis_url: &str, namespace: impl ToString) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(map_err)?;

        Ok(Self {
            conn: ConnectionManager::new(client).await.map_err(map_err)?,
            namespace: NameSpace(namespace.to_string()),
            scripts: Arc::new(Scripts::new()),
        })
    }

    async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        let mut conn = self.conn.clone();
        let next: Vec<(String, i64)> = conn
            .zrange_withscores(self.namespace.ready(), 0, 0)
            .await
            .map_err(map_err)?;
        next.first()
            .map(|(_, score)| timestamp_from_millis(*score))
            .transpose()
    }

    async fn claim_next_job(&self) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let claimed: Option<HashMap<String, String>> = self
            .scripts
            .claim
            .key(self.namespace.ready())
            .key(self.namespace.processing())
            .arg(Utc::now().timestamp_millis())
            .arg(self.namespace.job_prefix())
            .arg(CLAIM_WINDOW)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        claimed.map(job_from_map).transpose()
    }

    /// Serializes an execution error with the job's current attempt number
    /// stamped on, for appending to the job's error history.
    async fn error_json(&self, id: JobId, error: ExecutionError) -> Result<String, BackendError> {
        let mut conn = self.conn.clone();
        let attempt: Option<u16> = conn
            .hget(self.namespace.job(id), "attempt")
            .await
            .map_err(map_err)?;
        Ok(serde_json::to_string(
            &error.into_job_error(attempt.unwrap_or(0)),
        )?)
    }

    /// Runs one of the guarded `processing -> *` transition scripts and maps
    /// its return code.
    async fn transition(
        &self,
        id: JobId,
        invocation: &mut redis::ScriptInvocation<'_>,
    ) -> Result<i8, BackendError> {
        let mut conn = self.conn.clone();
        let code: i8 = invocation.invoke_async(&mut conn).await.map_err(map_err)?;
        match code {
            -1 => Err(BackendError::JobNotFound(id)),
            code => Ok(code),
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn subscribe_ready_jobs(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>> {
        let mut stream = ReadyJobStream {
            backend: self.clone(),
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<Job, BackendError> {
        let mut conn = self.conn.clone();
        let id: i32 = conn
            .incr(self.namespace.id_counter(), 1)
            .await
            .map_err(map_err)?;
        let job = job.into_job(id.into());

        redis::pipe()
            .atomic()
            .hset_multiple(self.namespace.job(job.id), &job_fields(&job)?)
            .ignore()
            .zadd(
                self.namespace.ready(),
                id,
                job.scheduled_at.timestamp_millis(),
            )
            .ignore()
            .zadd(
                self.namespace.index(),
                id,
                job.inserted_at.timestamp_millis(),
            )
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(job)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(self.namespace.job(id))
            .await
            .map_err(map_err)?;
        if map.is_empty() {
            return Ok(None);
        }
        job_from_map(map).map(Some)
    }

    async fn mark_job_complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.transition(
            id,
            self.scripts
                .complete
                .key(self.namespace.processing())
                .key(self.namespace.done())
                .arg(i32::from(id))
                .arg(self.namespace.job_prefix())
                .arg(Utc::now().timestamp_millis())
                .arg(serde_json::to_string(&result)?),
        )
        .await?;
        Ok(())
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_attempt_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let error = self.error_json(id, error).await?;
        self.transition(
            id,
            self.scripts
                .retry
                .key(self.namespace.processing())
                .key(self.namespace.ready())
                .arg(i32::from(id))
                .arg(self.namespace.job_prefix())
                .arg(next_attempt_at.timestamp_millis())
                .arg(error),
        )
        .await?;
        Ok(())
    }

    async fn mark_job_failed(&self, id: JobId, error: ExecutionError) -> Result<(), BackendError> {
        let error = self.error_json(id, error).await?;
        self.transition(
            id,
            self.scripts
                .fail
                .key(self.namespace.processing())
                .key(self.namespace.done())
                .arg(i32::from(id))
                .arg(self.namespace.job_prefix())
                .arg(Utc::now().timestamp_millis())
                .arg(error),
        )
        .await?;
        Ok(())
    }

    async fn mark_job_cancelled(&self, id: JobId) -> Result<bool, BackendError> {
        let code = self
            .transition(
                id,
                self.scripts
                    .cancel
                    .key(self.namespace.ready())
                    .key(self.namespace.processing())
                    .key(self.namespace.done())
                    .arg(i32::from(id))
                    .arg(self.namespace.job_prefix())
                    .arg(Utc::now().timestamp_millis()),
            )
            .await?;
        Ok(code == 1)
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), BackendError> {
        if progress > 100 {
            return Err(BackendError::InvalidProgress {
                id,
                detail: format!("value {progress} is outside 0..=100"),
            });
        }
        let code = self
            .transition(
                id,
                self.scripts
                    .progress
                    .arg(i32::from(id))
                    .arg(self.namespace.job_prefix())
                    .arg(progress),
            )
            .await?;
        match code {
            -2 => Err(BackendError::InvalidProgress {
                id,
                detail: "job is not processing".to_owned(),
            }),
            -3 => Err(BackendError::InvalidProgress {
                id,
                detail: "progress may not decrease".to_owned(),
            }),
            _ => Ok(()),
        }
    }

    async fn stats(&self) -> Result<QueueStats, BackendError> {
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed, delayed): (u64, u64, u64, u64, u64) = self
            .scripts
            .stats
            .key(self.namespace.index())
            .arg(Utc::now().timestamp_millis())
            .arg(self.namespace.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn prune_jobs(&self, older_than: TimeDelta) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let cutoff = (Utc::now() - older_than).timestamp_millis();
        self.scripts
            .prune
            .key(self.namespace.done())
            .key(self.namespace.index())
            .arg(cutoff)
            .arg(self.namespace.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn recover_stale_jobs(&self, stale_after: TimeDelta) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let error = ExecutionError {
            kind: ErrorKind::StaleClaim,
            message: format!("claim became stale after {stale_after}"),
        };
        // The attempt number is filled in per job by the script.
        let error = serde_json::to_string(&error.into_job_error(0))?;
        self.scripts
            .recover
            .key(self.namespace.processing())
            .key(self.namespace.ready())
            .key(self.namespace.done())
            .arg((now - stale_after).timestamp_millis())
            .arg(now.timestamp_millis())
            .arg(self.namespace.job_prefix())
            .arg(error)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)
    }
}

struct ReadyJobStream {
    backend: RedisBackend,
}

impl ReadyJobStream {
    /// Without cross-process notifications the stream polls; this bounds how
    /// long a newly enqueued job waits before a worker notices it.
    const POLL_INTERVAL: Duration = Duration::from_millis(500);
    const DELTA: Duration = Duration::from_millis(15);

    async fn next(&mut self) -> Result<Job, BackendError> {
        loop {
            let delay = match self.backend.next_scheduled_at().await? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::POLL_INTERVAL),
                None => Self::POLL_INTERVAL,
            };
            if delay <= Self::DELTA {
                if let Some(job) = self.backend.claim_next_job().await? {
                    return Ok(job);
                }
                // Another instance won the claim race, look again shortly.
                tokio::time::sleep(Self::DELTA).await;
                continue;
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn id_counter(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::IdCounter)
    }

    fn job(&self, id: JobId) -> NameSpacedKey<'_> {
        self.key(KeyType::Job(id.into()))
    }

    fn ready(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Ready)
    }

    fn processing(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Processing)
    }

    fn done(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Done)
    }

    fn index(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Index)
    }

    /// The prefix the Lua scripts concatenate with a job id to address its
    /// hash.
    fn job_prefix(&self) -> String {
        format!("{}:job:", self.0)
    }

    fn key(&self, kind: KeyType) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Job(id) => write!(f, ":job:{}", id),
            KeyType::IdCounter => write!(f, ":id_counter"),
            KeyType::Ready => write!(f, ":ready"),
            KeyType::Processing => write!(f, ":processing"),
            KeyType::Done => write!(f, ":done"),
            KeyType::Index => write!(f, ":index"),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType {
    Job(i32),
    IdCounter,
    Ready,
    Processing,
    Done,
    Index,
}

fn job_fields(job: &Job) -> Result<Vec<(&'static str, String)>, BackendError> {
    let mut fields = vec![
        ("id", i32::from(job.id).to_string()),
        ("kind", job.kind.clone()),
        ("data", serde_json::to_string(&job.data)?),
        ("status", job.status.as_str().to_owned()),
        ("progress", job.progress.to_string()),
        ("errors", serde_json::to_string(&job.errors)?),
        ("attempt", job.attempt.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("priority", job.priority.to_string()),
        ("inserted_at", job.inserted_at.timestamp_millis().to_string()),
        (
            "scheduled_at",
            job.scheduled_at.timestamp_millis().to_string(),
        ),
    ];
    if let Some(result) = &job.result {
        fields.push(("result", serde_json::to_string(result)?));
    }
    if let Some(at) = job.started_at {
        fields.push(("started_at", at.timestamp_millis().to_string()));
    }
    if let Some(at) = job.attempted_at {
        fields.push(("attempted_at", at.timestamp_millis().to_string()));
    }
    if let Some(at) = job.completed_at {
        fields.push(("completed_at", at.timestamp_millis().to_string()));
    }
    Ok(fields)
}

fn job_from_map(map: HashMap<String, String>) -> Result<Job, BackendError> {
    Ok(Job {
        id: JobId::from(parse::<i32>(&map, "id")?),
        kind: required(&map, "kind")?.to_owned(),
        data: serde_json::from_str(required(&map, "data")?)?,
        status: parse_status(required(&map, "status")?)?,
        progress: parse::<u8>(&map, "progress")?,
        result: map
            .get("result")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?,
        errors: serde_json::from_str(required(&map, "errors")?)?,
        attempt: parse::<u16>(&map, "attempt")?,
        max_attempts: parse::<u16>(&map, "max_attempts")?,
        priority: parse::<u16>(&map, "priority")?,
        inserted_at: timestamp_from_millis(parse::<i64>(&map, "inserted_at")?)?,
        scheduled_at: timestamp_from_millis(parse::<i64>(&map, "scheduled_at")?)?,
        started_at: optional_timestamp(&map, "started_at")?,
        attempted_at: optional_timestamp(&map, "attempted_at")?,
        completed_at: optional_timestamp(&map, "completed_at")?,
    })
}

fn required<'a>(map: &'a HashMap<String, String>, field: &str) -> Result<&'a str, BackendError> {
    map.get(field).map(String::as_str).ok_or_else(|| {
        tracing::error!("Stored job hash is missing the {field} field");
        BackendError::BadState
    })
}

fn parse<T: FromStr>(map: &HashMap<String, String>, field: &str) -> Result<T, BackendError> {
    required(map, field)?.parse().map_err(|_| {
        tracing::error!("Stored job hash has a corrupt {field} field");
        BackendError::BadState
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, BackendError> {
    raw.parse().map_err(|_| {
        tracing::error!("Stored job hash has an unknown status {raw}");
        BackendError::BadState
    })
}

fn timestamp_from_millis(millis: i64) -> Result<DateTime<Utc>, BackendError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        tracing::error!("Stored job hash has an out of range timestamp {millis}");
        BackendError::BadState
    })
}

fn optional_timestamp(
    map: &HashMap<String, String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, BackendError> {
    map.get(field)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| {
                    tracing::error!("Stored job hash has a corrupt {field} field");
                    BackendError::BadState
                })
                .and_then(timestamp_from_millis)
        })
        .transpose()
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use reporadar_jobs::job::JobError;

    use super::*;

    fn namespace() -> NameSpace {
        NameSpace("reporadar:test".to_owned())
    }

    #[test]
    fn keys_are_namespaced() {
        let ns = namespace();
        assert_eq!(ns.id_counter().to_string(), "reporadar:test:id_counter");
        assert_eq!(ns.job(JobId::from(42)).to_string(), "reporadar:test:job:42");
        assert_eq!(ns.ready().to_string(), "reporadar:test:ready");
        assert_eq!(ns.processing().to_string(), "reporadar:test:processing");
        assert_eq!(ns.done().to_string(), "reporadar:test:done");
        assert_eq!(ns.index().to_string(), "reporadar:test:index");
        assert_eq!(ns.job_prefix(), "reporadar:test:job:");
    }

    fn sample_job() -> Job {
        Job {
            id: JobId::from(7),
            kind: "repository_analysis".to_owned(),
            data: serde_json::json!({"repository": "rust-lang/rust"}),
            status: JobStatus::Failed,
            progress: 40,
            result: None,
            errors: vec![JobError {
                attempt: 1,
                kind: ErrorKind::Other("processor".to_owned()),
                message: "repository unavailable".to_owned(),
                recorded_at: timestamp_from_millis(1_700_000_500_000).unwrap(),
            }],
            attempt: 1,
            max_attempts: 3,
            priority: 2,
            inserted_at: timestamp_from_millis(1_700_000_000_000).unwrap(),
            scheduled_at: timestamp_from_millis(1_700_000_100_000).unwrap(),
            started_at: Some(timestamp_from_millis(1_700_000_200_000).unwrap()),
            attempted_at: Some(timestamp_from_millis(1_700_000_200_000).unwrap()),
            completed_at: Some(timestamp_from_millis(1_700_000_600_000).unwrap()),
        }
    }

    #[test]
    fn job_hash_encoding_round_trips() {
        let job = sample_job();

        let map: HashMap<String, String> = job_fields(&job)
            .unwrap()
            .into_iter()
            .map(|(field, value)| (field.to_owned(), value))
            .collect();
        let decoded = job_from_map(map).unwrap();

        assert_eq!(decoded, job);
    }

    #[test]
    fn optional_fields_are_omitted_from_the_hash() {
        let job = Job {
            result: None,
            started_at: None,
            attempted_at: None,
            completed_at: None,
            ..sample_job()
        };

        let fields = job_fields(&job).unwrap();

        for (field, _) in &fields {
            assert!(!matches!(
                *field,
                "result" | "started_at" | "attempted_at" | "completed_at"
            ));
        }
        let map: HashMap<String, String> = fields
            .into_iter()
            .map(|(field, value)| (field.to_owned(), value))
            .collect();
        let decoded = job_from_map(map).unwrap();
        assert_eq!(decoded.result, None);
        assert_eq!(decoded.completed_at, None);
    }

    #[test]
    fn corrupt_hashes_read_as_bad_state() {
        let mut map: HashMap<String, String> = job_fields(&sample_job())
            .unwrap()
            .into_iter()
            .map(|(field, value)| (field.to_owned(), value))
            .collect();

        map.insert("status".to_owned(), "sleeping".to_owned());
        assert_matches!(job_from_map(map.clone()), Err(BackendError::BadState));

        map.remove("status");
        assert_matches!(job_from_map(map.clone()), Err(BackendError::BadState));

        map.insert("status".to_owned(), "queued".to_owned());
        map.insert("attempt".to_owned(), "not-a-number".to_owned());
        assert_matches!(job_from_map(map), Err(BackendError::BadState));
    }

    #[test]
    fn statuses_round_trip_through_their_wire_form() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
        }
    }
}
