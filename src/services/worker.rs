//! Queue consumers: claim a job, dispatch it on its payload variant,
//! then ack or nack the lease.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::app_state::AppState;
use crate::models::job::{JobPayload, ProcessingJob, WebhookJob};
use crate::services::pipeline::{self, Attempt, PipelineOutcome};
use crate::services::queue::{self, JobFailure, JobQueue, Lease, NackOutcome, QueueError};
use crate::services::webhook;

/// Which payload variant a consumer pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Processing,
    Webhook,
}

impl WorkerRole {
    fn accepts(self, payload: &JobPayload) -> bool {
        matches!(
            (self, payload),
            (WorkerRole::Processing, JobPayload::ProcessVideo(_))
                | (WorkerRole::Webhook, JobPayload::DeliverWebhook(_))
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Processing => "processing",
            WorkerRole::Webhook => "webhook",
        }
    }
}

/// How a claimed lease was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked(NackOutcome),
}

/// Claim one job if one is ready and run it.
/// Returns `Ok(None)` when the queue had nothing to hand out.
pub async fn process_next_job(
    state: &AppState,
    queue: &dyn JobQueue,
    role: WorkerRole,
) -> Result<Option<Settlement>, WorkerError> {
    match queue.try_dequeue().await? {
        Some(lease) => process_lease(state, queue, role, &lease).await.map(Some),
        None => Ok(None),
    }
}

/// Run a claimed job and settle its lease.
pub async fn process_lease(
    state: &AppState,
    queue: &dyn JobQueue,
    role: WorkerRole,
    lease: &Lease,
) -> Result<Settlement, WorkerError> {
    tracing::debug!(
        queue = %lease.queue,
        job_id = %lease.id(),
        job_type = %lease.envelope.job_type,
        attempt = lease.attempt,
        "Job claimed"
    );

    let result = if role.accepts(lease.payload()) {
        match lease.payload() {
            JobPayload::ProcessVideo(job) => handle_processing(state, job, Attempt::from(lease)).await,
            JobPayload::DeliverWebhook(job) => handle_webhook(state, job, lease).await,
        }
    } else {
        Err(JobFailure::terminal(format!(
            "{} job routed to the {} queue",
            lease.envelope.job_type,
            role.as_str()
        )))
    };

    match result {
        Ok(()) => {
            queue.ack(lease).await?;
            Ok(Settlement::Acked)
        }
        Err(failure) => {
            let outcome = queue.nack(lease, &failure).await?;
            match outcome {
                NackOutcome::Retrying { next_attempt, delay } => {
                    tracing::info!(
                        queue = %lease.queue,
                        job_id = %lease.id(),
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Job scheduled for retry"
                    );
                }
                NackOutcome::DeadLettered => {
                    metrics::counter!("queue_dead_lettered_total", "queue" => lease.queue.clone())
                        .increment(1);
                    tracing::error!(
                        queue = %lease.queue,
                        job_id = %lease.id(),
                        job_type = %lease.envelope.job_type,
                        video_id = %lease.payload().video_id(),
                        attempts = lease.attempt,
                        error = %failure.message,
                        "Job moved to dead-letter state, manual inspection required"
                    );
                }
            }
            Ok(Settlement::Nacked(outcome))
        }
    }
}

async fn handle_processing(
    state: &AppState,
    job: &ProcessingJob,
    attempt: Attempt,
) -> Result<(), JobFailure> {
    match pipeline::run(state, job, attempt).await {
        Ok(PipelineOutcome::Completed { .. }) => {
            metrics::counter!("processing_jobs_completed").increment(1);
            Ok(())
        }
        Ok(PipelineOutcome::Skipped { .. } | PipelineOutcome::Superseded { .. }) => {
            metrics::counter!("processing_jobs_skipped").increment(1);
            Ok(())
        }
        Err(e) => {
            if e.is_retryable() && !attempt.is_final() {
                metrics::counter!("processing_jobs_retried").increment(1);
                Err(JobFailure::retryable(e.to_string()))
            } else {
                metrics::counter!("processing_jobs_failed").increment(1);
                Err(JobFailure {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                })
            }
        }
    }
}

async fn handle_webhook(state: &AppState, job: &WebhookJob, lease: &Lease) -> Result<(), JobFailure> {
    match webhook::handle(state, job).await {
        Ok(outcome) => {
            metrics::counter!("webhook_deliveries_total", "outcome" => outcome.label()).increment(1);
            Ok(())
        }
        Err(e) => {
            let retrying = e.is_retryable() && !lease.is_final_attempt();
            let label = if retrying { "retrying" } else { "failed" };
            metrics::counter!("webhook_deliveries_total", "outcome" => label).increment(1);
            tracing::warn!(
                video_id = %job.video_id,
                job_id = %lease.id(),
                attempt = lease.attempt,
                error = %e,
                "Webhook delivery failed"
            );
            Err(JobFailure {
                message: e.to_string(),
                retryable: e.is_retryable(),
            })
        }
    }
}

/// Consume `queue` until `cancel` fires. A job already claimed is always
/// run to completion before the loop exits.
pub async fn run_worker(
    state: AppState,
    queue: Arc<dyn JobQueue>,
    role: WorkerRole,
    worker_id: usize,
    cancel: CancellationToken,
) {
    tracing::info!(queue = %queue.name(), role = role.as_str(), worker_id, "Worker started");

    loop {
        let lease = match queue::next_job(queue.as_ref(), &cancel).await {
            Ok(Some(lease)) => lease,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(queue = %queue.name(), worker_id, error = %e, "Failed to claim job");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(queue.settings().poll_interval) => continue,
                }
            }
        };

        if let Err(e) = process_lease(&state, queue.as_ref(), role, &lease).await {
            // The lease expires and the job becomes claimable again.
            tracing::error!(
                queue = %queue.name(),
                job_id = %lease.id(),
                worker_id,
                error = %e,
                "Failed to settle job"
            );
        }
    }

    tracing::info!(queue = %queue.name(), role = role.as_str(), worker_id, "Worker stopped");
}

pub async fn run_processing_worker(state: AppState, worker_id: usize, cancel: CancellationToken) {
    let queue = state.processing_queue.clone();
    run_worker(state, queue, WorkerRole::Processing, worker_id, cancel).await;
}

pub async fn run_webhook_worker(state: AppState, worker_id: usize, cancel: CancellationToken) {
    let queue = state.webhook_queue.clone();
    run_worker(state, queue, WorkerRole::Webhook, worker_id, cancel).await;
}

/// Publish `queue_depth{queue,state}` gauges every `interval`.
pub async fn report_queue_depths(state: AppState, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for queue in state.queues() {
                    match queue.depth().await {
                        Ok(depth) => {
                            let name = queue.name().to_string();
                            for (label, value) in [
                                ("ready", depth.ready),
                                ("delayed", depth.delayed),
                                ("leased", depth.leased),
                                ("dead", depth.dead),
                            ] {
                                metrics::gauge!("queue_depth", "queue" => name.clone(), "state" => label)
                                    .set(value as f64);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(queue = %queue.name(), error = %e, "Failed to read queue depth");
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
