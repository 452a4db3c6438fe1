//! Durable job queue with visibility leases, exponential backoff and a
//! dead-letter state.
//!
//! Two independently configured instances run side by side: one for
//! processing jobs and one for webhook deliveries.

mod memory;
mod redis_queue;

pub use self::memory::MemoryQueue;
pub use self::redis_queue::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::JobPayload;

/// Highest accepted priority value. Lower values are served first.
pub const MAX_PRIORITY: u8 = 100;

/// Exponential backoff: `base × 2^(attempt − 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Configuration of one queue instance.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    /// Dead letters kept for inspection; the oldest are dropped first.
    pub dead_letter_retention: usize,
}

pub const DEFAULT_DEAD_LETTER_RETENTION: usize = 1000;

impl QueueSettings {
    /// Processing queue defaults: 3 attempts, 2s base delay.
    pub fn processing() -> Self {
        Self {
            name: "video-processing".to_string(),
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60)),
            visibility_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_secs(1),
            dead_letter_retention: DEFAULT_DEAD_LETTER_RETENTION,
        }
    }

    /// Webhook queue defaults: 5 attempts, 1s base delay.
    pub fn webhook() -> Self {
        Self {
            name: "webhook-notifications".to_string(),
            max_attempts: 5,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            dead_letter_retention: DEFAULT_DEAD_LETTER_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Duration,
    pub priority: u8,
    /// Falls back to the queue's configured attempts.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Identifies an enqueued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: String,
}

/// Stored form of a job while it is owned by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub job_type: String,
    pub payload: JobPayload,
    pub priority: u8,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobEnvelope {
    fn new(payload: JobPayload, options: &EnqueueOptions, default_attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: payload.job_type().to_string(),
            payload,
            priority: options.priority.min(MAX_PRIORITY),
            max_attempts: options.max_attempts.unwrap_or(default_attempts).max(1),
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }
}

/// A claimed job. Only the holder of the lease token may ack or nack it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub queue: String,
    pub token: Uuid,
    /// 1-based attempt number of this claim.
    pub attempt: u32,
    pub envelope: JobEnvelope,
}

impl Lease {
    pub fn id(&self) -> Uuid {
        self.envelope.id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.envelope.payload
    }

    pub fn max_attempts(&self) -> u32 {
        self.envelope.max_attempts
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.envelope.max_attempts
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.envelope.id,
            queue: self.queue.clone(),
        }
    }
}

/// Why a job attempt failed, and whether another attempt may help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Retrying { next_attempt: u32, delay: Duration },
    DeadLettered,
}

/// Decide what a failed attempt turns into.
pub fn nack_outcome(backoff: &BackoffPolicy, lease: &Lease, failure: &JobFailure) -> NackOutcome {
    if failure.retryable && !lease.is_final_attempt() {
        NackOutcome::Retrying {
            next_attempt: lease.attempt + 1,
            delay: backoff.delay_for(lease.attempt),
        }
    } else {
        NackOutcome::DeadLettered
    }
}

/// Inspectable record of a job that will not be attempted again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: JobPayload,
    pub last_error: String,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    fn from_lease(lease: &Lease, error: &str) -> Self {
        Self {
            job_id: lease.envelope.id,
            queue: lease.queue.clone(),
            job_type: lease.envelope.job_type.clone(),
            payload: lease.envelope.payload.clone(),
            last_error: error.to_string(),
            attempts: lease.attempt,
            enqueued_at: lease.envelope.enqueued_at,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub leased: u64,
    pub dead: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn settings(&self) -> &QueueSettings;

    fn name(&self) -> &str {
        &self.settings().name
    }

    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions)
        -> Result<JobHandle, QueueError>;

    /// Claim the next available job, if any, under a fresh visibility lease.
    async fn try_dequeue(&self) -> Result<Option<Lease>, QueueError>;

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    async fn nack(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, QueueError>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Block until a job can be claimed or `cancel` fires.
pub async fn next_job(
    queue: &dyn JobQueue,
    cancel: &CancellationToken,
) -> Result<Option<Lease>, QueueError> {
    let poll_interval = queue.settings().poll_interval;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(lease) = queue.try_dequeue().await? {
            return Ok(Some(lease));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lease on job {0} is no longer held by this consumer")]
    LeaseLost(Uuid),
}
