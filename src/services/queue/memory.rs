use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    nack_outcome, DeadLetter, EnqueueOptions, JobEnvelope, JobFailure, JobHandle, JobQueue,
    Lease, NackOutcome, QueueDepth, QueueError, QueueSettings,
};
use crate::models::job::JobPayload;

enum Slot {
    Waiting { available_at: Instant },
    Leased { token: Uuid, expires_at: Instant },
}

struct Entry {
    envelope: JobEnvelope,
    attempts: u32,
    slot: Slot,
}

impl Entry {
    fn claimable(&self, now: Instant) -> bool {
        match self.slot {
            Slot::Waiting { available_at } => available_at <= now,
            Slot::Leased { expires_at, .. } => expires_at <= now,
        }
    }

    fn held_by(&self, token: Uuid) -> bool {
        matches!(self.slot, Slot::Leased { token: held, .. } if held == token)
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Entry>,
    dead: Vec<DeadLetter>,
}

/// In-process queue with the same lease, backoff and dead-letter rules as
/// [`super::RedisQueue`]. Nothing survives a restart.
pub struct MemoryQueue {
    settings: QueueSettings,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Payloads that have not reached a terminal queue state yet.
    pub fn pending_payloads(&self) -> Vec<JobPayload> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner.jobs.values().collect();
        entries.sort_by_key(|e| e.envelope.id);
        entries.iter().map(|e| e.envelope.payload.clone()).collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        let envelope = JobEnvelope::new(payload, &options, self.settings.max_attempts);
        let handle = JobHandle {
            id: envelope.id,
            queue: self.settings.name.clone(),
        };
        let entry = Entry {
            envelope,
            attempts: 0,
            slot: Slot::Waiting {
                available_at: Instant::now() + options.delay,
            },
        };
        self.lock().jobs.insert(handle.id, entry);
        Ok(handle)
    }

    async fn try_dequeue(&self) -> Result<Option<Lease>, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();

        let next = inner
            .jobs
            .values()
            .filter(|e| e.claimable(now))
            .min_by_key(|e| (e.envelope.priority, e.envelope.id))
            .map(|e| e.envelope.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        entry.attempts += 1;
        entry.slot = Slot::Leased {
            token,
            expires_at: now + self.settings.visibility_timeout,
        };

        Ok(Some(Lease {
            queue: self.settings.name.clone(),
            token,
            attempt: entry.attempts,
            envelope: entry.envelope.clone(),
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let held = inner
            .jobs
            .get(&lease.id())
            .is_some_and(|entry| entry.held_by(lease.token));
        if !held {
            return Err(QueueError::LeaseLost(lease.id()));
        }
        inner.jobs.remove(&lease.id());
        Ok(())
    }

    async fn nack(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, QueueError> {
        let outcome = nack_outcome(&self.settings.backoff, lease, failure);
        let mut guard = self.lock();
        let inner = &mut *guard;

        let entry = match inner.jobs.get_mut(&lease.id()) {
            Some(entry) if entry.held_by(lease.token) => entry,
            _ => return Err(QueueError::LeaseLost(lease.id())),
        };

        match outcome {
            NackOutcome::Retrying { delay, .. } => {
                entry.envelope.last_error = Some(failure.message.clone());
                entry.slot = Slot::Waiting {
                    available_at: Instant::now() + delay,
                };
            }
            NackOutcome::DeadLettered => {
                inner.jobs.remove(&lease.id());
                inner.dead.push(DeadLetter::from_lease(lease, &failure.message));
                let excess = inner
                    .dead
                    .len()
                    .saturating_sub(self.settings.dead_letter_retention);
                inner.dead.drain(..excess);
            }
        }
        Ok(outcome)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let inner = self.lock();
        Ok(inner.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = Instant::now();
        let inner = self.lock();
        let mut depth = QueueDepth {
            dead: inner.dead.len() as u64,
            ..QueueDepth::default()
        };
        for entry in inner.jobs.values() {
            match entry.slot {
                Slot::Waiting { available_at } if available_at <= now => depth.ready += 1,
                Slot::Waiting { .. } => depth.delayed += 1,
                Slot::Leased { .. } => depth.leased += 1,
            }
        }
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
