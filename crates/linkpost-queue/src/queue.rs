//! Delayed job queue on Redis.
//!
//! Layout under the configured prefix:
//! - `{prefix}:job:{key}` hash holding the job record
//! - `{prefix}:delayed` sorted set scored by due time (ms)
//! - `{prefix}:active` sorted set scored by lease deadline (ms)
//! - `{prefix}:dead` capped list of dead letters (JSON)
//!
//! Every state change runs as a Lua script so a job is never in two sets.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{fail_outcome, JobBackend};
use crate::error::{QueueError, QueueResult};
use crate::job::{
    DeadLetter, ExpiredLeases, FailOutcome, FailureKind, JobRecord, JobState, LeasedJob, PublishPostJob,
    QueueStats, RetryPolicy, DEFAULT_DEAD_LETTER_MAX,
};

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1],
    'payload', ARGV[2], 'state', 'delayed', 'attempts', 0,
    'max_attempts', ARGV[3], 'backoff_ms', ARGV[4], 'due_ms', ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[5], ARGV[1])
return 1
"#;

const REMOVE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 0
end
if state ~= 'delayed' then
    return -1
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#;

const FETCH_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local out = {}
for i, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    local hkey = ARGV[4] .. member
    if redis.call('EXISTS', hkey) == 1 then
        local attempts = redis.call('HINCRBY', hkey, 'attempts', 1)
        local token = ARGV[5] .. ':' .. i
        redis.call('HSET', hkey, 'state', 'active', 'token', token)
        redis.call('ZADD', KEYS[2], ARGV[3], member)
        local fields = redis.call('HMGET', hkey, 'payload', 'max_attempts', 'backoff_ms')
        table.insert(out, member)
        table.insert(out, fields[1])
        table.insert(out, tostring(attempts))
        table.insert(out, fields[2])
        table.insert(out, fields[3])
        table.insert(out, token)
    end
end
return out
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
    return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
    return 0
end
redis.call('HSET', KEYS[1], 'state', 'delayed', 'due_ms', ARGV[3], 'last_error', ARGV[4])
redis.call('HDEL', KEYS[1], 'token')
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

const DEAD_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
    return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[3])
redis.call('LTRIM', KEYS[3], 0, tonumber(ARGV[4]) - 1)
return 1
"#;

/// Fields per job in the FETCH_DUE reply.
const FETCH_STRIDE: usize = 6;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix shared by every queue key
    pub prefix: String,
    /// Attempts per job, including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub backoff_base: Duration,
    /// How long a leased job may run before it is handed out again
    pub visibility_timeout: Duration,
    /// Dead letters kept
    pub dead_letter_max: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "linkpost".to_string(),
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
            visibility_timeout: Duration::from_secs(300),
            dead_letter_max: DEFAULT_DEAD_LETTER_MAX,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or_else(|_| "linkpost".to_string()),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            backoff_base: Duration::from_millis(
                std::env::var("QUEUE_BACKOFF_BASE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
            ),
            visibility_timeout: Duration::from_secs(
                std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            dead_letter_max: std::env::var("QUEUE_DEAD_LETTER_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        }
    }

    /// Retry policy for newly enqueued jobs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base)
    }
}

/// Redis-backed [`JobBackend`].
pub struct RedisJobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl RedisJobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Check connectivity.
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        info!("Connected to Redis queue (prefix {})", self.config.prefix);
        Ok(())
    }

    /// Most recent dead letters, newest first.
    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let mut conn = self.conn().await?;
        let stop = limit.saturating_sub(1) as isize;
        let raw: Vec<String> = conn.lrange(self.dead_key(), 0, stop).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(QueueError::from))
            .collect()
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.config.prefix)
    }

    fn job_hash(&self, key: &str) -> String {
        format!("{}{}", self.job_key_prefix(), key)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.config.prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.config.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.config.prefix)
    }

    async fn retry_leased(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        token: &str,
        delay: Duration,
        error: &str,
    ) -> QueueResult<bool> {
        let due_ms = now_ms() + delay.as_millis() as i64;
        let moved: i32 = Script::new(RETRY_SCRIPT)
            .key(self.job_hash(key))
            .key(self.active_key())
            .key(self.delayed_key())
            .arg(key)
            .arg(token)
            .arg(due_ms)
            .arg(error)
            .invoke_async(conn)
            .await?;
        Ok(moved == 1)
    }

    async fn dead_letter_leased(
        &self,
        conn: &mut MultiplexedConnection,
        token: &str,
        entry: &DeadLetter,
    ) -> QueueResult<bool> {
        let encoded = serde_json::to_string(entry)?;
        let moved: i32 = Script::new(DEAD_SCRIPT)
            .key(self.job_hash(&entry.key))
            .key(self.active_key())
            .key(self.dead_key())
            .arg(&entry.key)
            .arg(token)
            .arg(encoded)
            .arg(self.config.dead_letter_max.max(1))
            .invoke_async(conn)
            .await?;
        Ok(moved == 1)
    }
}

#[async_trait]
impl JobBackend for RedisJobQueue {
    async fn enqueue(&self, job: &PublishPostJob, delay: Duration, policy: &RetryPolicy) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let key = job.key();
        let payload = serde_json::to_string(job)?;
        let due_ms = now_ms() + delay.as_millis() as i64;

        let added: i32 = Script::new(ENQUEUE_SCRIPT)
            .key(self.job_hash(&key))
            .key(self.delayed_key())
            .arg(&key)
            .arg(&payload)
            .arg(policy.max_attempts)
            .arg(policy.backoff_base.as_millis() as u64)
            .arg(due_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        if added == 0 {
            warn!("Duplicate job rejected: {}", key);
            return Err(QueueError::DuplicateJob(key));
        }

        counter!("linkpost_queue_enqueued_total").increment(1);
        info!("Enqueued job {} due in {:?}", key, delay);
        Ok(())
    }

    async fn find_by_key(&self, key: &str) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_hash(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_record(key, &fields).map(Some)
    }

    async fn remove(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i32 = Script::new(REMOVE_SCRIPT)
            .key(self.job_hash(key))
            .key(self.delayed_key())
            .arg(key)
            .invoke_async(&mut conn)
            .await?;

        match removed {
            1 => {
                debug!("Removed job {}", key);
                Ok(true)
            }
            -1 => {
                debug!("Job {} is running, not removed", key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn fetch_due(&self, limit: usize) -> QueueResult<Vec<LeasedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let now = now_ms();
        let deadline = now + self.config.visibility_timeout.as_millis() as i64;
        let token_prefix = Uuid::new_v4().to_string();

        let raw: Vec<String> = Script::new(FETCH_DUE_SCRIPT)
            .key(self.delayed_key())
            .key(self.active_key())
            .arg(now)
            .arg(limit)
            .arg(deadline)
            .arg(self.job_key_prefix())
            .arg(token_prefix)
            .invoke_async(&mut conn)
            .await?;

        let leased = raw
            .chunks_exact(FETCH_STRIDE)
            .map(parse_leased)
            .collect::<QueueResult<Vec<_>>>()?;

        if !leased.is_empty() {
            debug!("Leased {} due job(s)", leased.len());
        }
        Ok(leased)
    }

    async fn complete(&self, job: &LeasedJob) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let done: i32 = Script::new(COMPLETE_SCRIPT)
            .key(self.job_hash(&job.key))
            .key(self.active_key())
            .arg(&job.key)
            .arg(&job.lease_token)
            .invoke_async(&mut conn)
            .await?;

        if done == 0 {
            return Err(QueueError::LeaseLost(job.key.clone()));
        }
        counter!("linkpost_queue_completed_total").increment(1);
        debug!("Completed job {}", job.key);
        Ok(())
    }

    async fn fail(&self, job: &LeasedJob, error: &str, kind: FailureKind) -> QueueResult<FailOutcome> {
        let mut conn = self.conn().await?;
        let outcome = fail_outcome(job, kind);

        let moved = match outcome {
            FailOutcome::Retrying { delay, .. } => {
                self.retry_leased(&mut conn, &job.key, &job.lease_token, delay, error)
                    .await?
            }
            FailOutcome::DeadLettered => {
                let entry = DeadLetter {
                    key: job.key.clone(),
                    payload: job.payload,
                    attempts_made: job.attempt,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                };
                self.dead_letter_leased(&mut conn, &job.lease_token, &entry).await?
            }
        };

        if !moved {
            return Err(QueueError::LeaseLost(job.key.clone()));
        }

        let label = match outcome {
            FailOutcome::Retrying { .. } => "retrying",
            FailOutcome::DeadLettered => "dead_lettered",
        };
        counter!("linkpost_queue_failed_total", "outcome" => label).increment(1);
        Ok(outcome)
    }

    async fn requeue_expired(&self) -> QueueResult<ExpiredLeases> {
        let mut conn = self.conn().await?;
        let expired: Vec<String> = conn
            .zrangebyscore(self.active_key(), "-inf", now_ms())
            .await?;

        let mut report = ExpiredLeases::default();
        for key in expired {
            let fields: HashMap<String, String> = conn.hgetall(self.job_hash(&key)).await?;
            let Some(token) = fields.get("token").cloned() else {
                // Record gone; drop the orphaned lease entry
                let _: i32 = conn.zrem(self.active_key(), &key).await?;
                continue;
            };
            let record = parse_record(&key, &fields)?;

            if record.attempts_made >= record.max_attempts {
                let entry = DeadLetter {
                    key: key.clone(),
                    payload: record.payload,
                    attempts_made: record.attempts_made,
                    error: "lease expired".to_string(),
                    failed_at: Utc::now(),
                };
                if self.dead_letter_leased(&mut conn, &token, &entry).await? {
                    warn!("Lease expired for job {} on its last attempt, dead-lettered", key);
                    report.dead_lettered.push(entry);
                }
            } else if self
                .retry_leased(&mut conn, &key, &token, Duration::ZERO, "lease expired")
                .await?
            {
                warn!("Lease expired for job {}, requeued", key);
                report.requeued += 1;
            }
        }

        if !report.is_empty() {
            counter!("linkpost_queue_leases_expired_total").increment(report.total() as u64);
        }
        Ok(report)
    }

    async fn find_dead_letter(&self, key: &str) -> QueueResult<Option<DeadLetter>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.lrange(self.dead_key(), 0, -1).await?;
        for entry in raw {
            let dead: DeadLetter = serde_json::from_str(&entry)?;
            if dead.key == key {
                return Ok(Some(dead));
            }
        }
        Ok(None)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await?;
        let delayed: u64 = conn.zcard(self.delayed_key()).await?;
        let active: u64 = conn.zcard(self.active_key()).await?;
        let dead: u64 = conn.llen(self.dead_key()).await?;
        Ok(QueueStats { delayed, active, dead })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_num<T: std::str::FromStr>(field: &str, value: Option<&String>) -> QueueResult<T> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| QueueError::serialization(format!("missing or invalid field '{}'", field)))
}

fn parse_record(key: &str, fields: &HashMap<String, String>) -> QueueResult<JobRecord> {
    let payload = fields
        .get("payload")
        .ok_or_else(|| QueueError::serialization("missing field 'payload'"))?;
    let state = fields
        .get("state")
        .and_then(|s| JobState::parse(s))
        .ok_or_else(|| QueueError::serialization("missing or invalid field 'state'"))?;

    Ok(JobRecord {
        key: key.to_string(),
        payload: serde_json::from_str(payload)?,
        state,
        attempts_made: parse_num("attempts", fields.get("attempts"))?,
        max_attempts: parse_num("max_attempts", fields.get("max_attempts"))?,
        due_at: ms_to_datetime(parse_num("due_ms", fields.get("due_ms"))?),
        last_error: fields.get("last_error").cloned(),
    })
}

fn parse_leased(chunk: &[String]) -> QueueResult<LeasedJob> {
    let backoff_ms: u64 = parse_num("backoff_ms", chunk.get(4))?;
    Ok(LeasedJob {
        key: chunk[0].clone(),
        payload: serde_json::from_str(&chunk[1])?,
        attempt: parse_num("attempts", chunk.get(2))?,
        max_attempts: parse_num("max_attempts", chunk.get(3))?,
        backoff_base: Duration::from_millis(backoff_ms),
        lease_token: chunk[5].clone(),
    })
}
