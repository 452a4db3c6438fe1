use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{
    nack_outcome, DeadLetter, EnqueueOptions, JobEnvelope, JobFailure, JobHandle, JobQueue,
    Lease, NackOutcome, QueueDepth, QueueError, QueueSettings,
};
use crate::models::job::JobPayload;

/// Promote due delayed jobs and expired leases, then claim the best ready job.
///
/// Ready members are scored by priority; equal scores pop in member order,
/// and job ids are UUIDv7 so that order is enqueue order.
const CLAIM_SCRIPT: &str = r#"
local function requeue(id)
  local priority = tonumber(redis.call('HGET', KEYS[7], id) or '0')
  redis.call('ZADD', KEYS[1], priority, id)
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])) do
  redis.call('ZREM', KEYS[2], id)
  requeue(id)
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('HDEL', KEYS[4], id)
  requeue(id)
end
while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then
    return false
  end
  local id = popped[1]
  local body = redis.call('HGET', KEYS[6], id)
  if body then
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    redis.call('HSET', KEYS[4], id, ARGV[3])
    local attempts = redis.call('HINCRBY', KEYS[5], id, 1)
    return {id, tostring(attempts), body}
  end
  redis.call('HDEL', KEYS[5], id)
  redis.call('HDEL', KEYS[7], id)
end
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[4])
return 1
"#;

/// Move a leased job to the dead set, scored by failure time, and drop the
/// oldest entries beyond the retention cap.
const DEAD_LETTER_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('ZADD', KEYS[6], ARGV[4], ARGV[3])
redis.call('ZREMRANGEBYRANK', KEYS[6], 0, -(tonumber(ARGV[5]) + 1))
return 1
"#;

struct Keys {
    jobs: String,
    priority: String,
    attempts: String,
    ready: String,
    delayed: String,
    leased: String,
    tokens: String,
    dead: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:{queue}");
        Self {
            jobs: format!("{base}:jobs"),
            priority: format!("{base}:priority"),
            attempts: format!("{base}:attempts"),
            ready: format!("{base}:ready"),
            delayed: format!("{base}:delayed"),
            leased: format!("{base}:leased"),
            tokens: format!("{base}:tokens"),
            dead: format!("{base}:dead"),
        }
    }
}

/// Redis-backed durable queue.
pub struct RedisQueue {
    client: redis::Client,
    settings: QueueSettings,
    keys: Keys,
    claim: Script,
    ack: Script,
    retry: Script,
    dead_letter: Script,
}

impl RedisQueue {
    pub fn new(redis_url: &str, key_prefix: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        let keys = Keys::new(key_prefix, &settings.name);
        Ok(Self {
            client,
            settings,
            keys,
            claim: Script::new(CLAIM_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            dead_letter: Script::new(DEAD_LETTER_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        let envelope = JobEnvelope::new(payload, &options, self.settings.max_attempts);
        let id = envelope.id.to_string();
        let body = serde_json::to_string(&envelope).map_err(QueueError::Serialize)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.keys.jobs, &id, &body)
            .ignore()
            .hset(&self.keys.priority, &id, i64::from(envelope.priority))
            .ignore();
        if options.delay.is_zero() {
            pipe.zadd(&self.keys.ready, &id, i64::from(envelope.priority))
                .ignore();
        } else {
            let available_at = now_ms() + options.delay.as_millis() as i64;
            pipe.zadd(&self.keys.delayed, &id, available_at).ignore();
        }

        let mut conn = self.connection().await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        tracing::debug!(
            queue = %self.settings.name,
            job_id = %envelope.id,
            job_type = %envelope.job_type,
            delay_ms = options.delay.as_millis() as u64,
            "Job enqueued"
        );

        Ok(JobHandle {
            id: envelope.id,
            queue: self.settings.name.clone(),
        })
    }

    async fn try_dequeue(&self) -> Result<Option<Lease>, QueueError> {
        let now = now_ms();
        let lease_until = now + self.settings.visibility_timeout.as_millis() as i64;
        let token = Uuid::new_v4();

        let mut conn = self.connection().await?;
        let claimed: Option<(String, String, String)> = self
            .claim
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.leased)
            .key(&self.keys.tokens)
            .key(&self.keys.attempts)
            .key(&self.keys.jobs)
            .key(&self.keys.priority)
            .arg(now)
            .arg(lease_until)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        let Some((id, attempts, body)) = claimed else {
            return Ok(None);
        };

        let envelope: JobEnvelope = serde_json::from_str(&body).map_err(QueueError::Serialize)?;
        let attempt = attempts.parse::<u32>().unwrap_or(1);

        tracing::debug!(queue = %self.settings.name, job_id = %id, attempt, "Job claimed");

        Ok(Some(Lease {
            queue: self.settings.name.clone(),
            token,
            attempt,
            envelope,
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let acked: i64 = self
            .ack
            .key(&self.keys.leased)
            .key(&self.keys.tokens)
            .key(&self.keys.attempts)
            .key(&self.keys.jobs)
            .key(&self.keys.priority)
            .arg(lease.id().to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        if acked == 0 {
            return Err(QueueError::LeaseLost(lease.id()));
        }
        Ok(())
    }

    async fn nack(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, QueueError> {
        let outcome = nack_outcome(&self.settings.backoff, lease, failure);
        let mut conn = self.connection().await?;

        let moved: i64 = match outcome {
            NackOutcome::Retrying { delay, .. } => {
                let mut envelope = lease.envelope.clone();
                envelope.last_error = Some(failure.message.clone());
                let body = serde_json::to_string(&envelope).map_err(QueueError::Serialize)?;
                let available_at = now_ms() + delay.as_millis() as i64;

                self.retry
                    .key(&self.keys.leased)
                    .key(&self.keys.tokens)
                    .key(&self.keys.delayed)
                    .key(&self.keys.jobs)
                    .arg(lease.id().to_string())
                    .arg(lease.token.to_string())
                    .arg(available_at)
                    .arg(body)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(QueueError::Redis)?
            }
            NackOutcome::DeadLettered => {
                let dead = DeadLetter::from_lease(lease, &failure.message);
                let body = serde_json::to_string(&dead).map_err(QueueError::Serialize)?;

                self.dead_letter
                    .key(&self.keys.leased)
                    .key(&self.keys.tokens)
                    .key(&self.keys.attempts)
                    .key(&self.keys.jobs)
                    .key(&self.keys.priority)
                    .key(&self.keys.dead)
                    .arg(lease.id().to_string())
                    .arg(lease.token.to_string())
                    .arg(body)
                    .arg(dead.failed_at.timestamp_millis())
                    .arg(self.settings.dead_letter_retention.max(1))
                    .invoke_async(&mut conn)
                    .await
                    .map_err(QueueError::Redis)?
            }
        };

        if moved == 0 {
            return Err(QueueError::LeaseLost(lease.id()));
        }
        Ok(outcome)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let bodies: Vec<String> = conn
            .zrevrange(&self.keys.dead, 0, limit as isize - 1)
            .await
            .map_err(QueueError::Redis)?;

        bodies
            .iter()
            .map(|body| serde_json::from_str::<DeadLetter>(body).map_err(QueueError::Serialize))
            .collect()
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.connection().await?;
        let (ready, delayed, leased, dead): (u64, u64, u64, u64) = redis::pipe()
            .zcard(&self.keys.ready)
            .zcard(&self.keys.delayed)
            .zcard(&self.keys.leased)
            .zcard(&self.keys.dead)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        Ok(QueueDepth {
            ready,
            delayed,
            leased,
            dead,
        })
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}
