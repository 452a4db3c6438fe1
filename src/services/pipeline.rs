//! Execution of one processing job: fetch, probe, extract a frame, detect,
//! redact, publish and record the outcome.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use image::DynamicImage;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::StoreError;
use crate::models::face::{DetectedFace, FaceRecord};
use crate::models::job::{DeliveryStatus, JobPayload, ProcessingJob, WebhookJob};
use crate::models::video::{RedactionMode, VideoRecord, VideoStatus, VideoUpdate};
use crate::services::detector::DetectorError;
use crate::services::media::{self, MediaError, FRAME_HEIGHT, FRAME_WIDTH};
use crate::services::queue::{EnqueueOptions, JobHandle, Lease, QueueError};
use crate::services::redaction::{self, RedactionError};
use crate::services::storage::{PublishMetadata, StorageError};

pub const PROGRESS_CLAIMED: i32 = 10;
pub const PROGRESS_FACES_DETECTED: i32 = 50;
pub const PROGRESS_COMPLETED: i32 = 100;

const INPUT_FILE: &str = "input.mp4";

/// Enqueue tries for a terminal webhook before the job itself is retried.
const NOTIFY_ENQUEUE_TRIES: u32 = 3;

/// Which attempt of the job this run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max_attempts: u32,
}

impl Attempt {
    pub fn is_final(self) -> bool {
        self.number >= self.max_attempts
    }
}

impl From<&Lease> for Attempt {
    fn from(lease: &Lease) -> Self {
        Self {
            number: lease.attempt,
            max_attempts: lease.max_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed {
        faces_detected: usize,
        screenshot_url: Option<String>,
        duration_ms: i64,
    },
    /// The video already reached a terminal state; at most its missing
    /// webhook was queued.
    Skipped { status: VideoStatus },
    /// A newer job owns the video; this one did nothing.
    Superseded { active_job_id: Uuid },
}

struct Published {
    faces: usize,
    screenshot: Option<(String, String)>,
}

/// Run one processing job to completion or to a recorded failure.
///
/// On error the returned [`PipelineError`] tells the queue whether another
/// attempt may help. The video is marked failed, and a failure webhook
/// enqueued, only when no further attempt will follow.
pub async fn run(
    state: &AppState,
    job: &ProcessingJob,
    attempt: Attempt,
) -> Result<PipelineOutcome, PipelineError> {
    let video = state
        .store
        .get(job.video_id)
        .await?
        .ok_or(PipelineError::VideoNotFound(job.video_id))?;

    if let Some(active_job_id) = video.active_job_id.filter(|active| *active != job.job_id) {
        tracing::info!(
            video_id = %job.video_id,
            job_id = %job.job_id,
            active_job_id = %active_job_id,
            "Job superseded by a newer one, skipping"
        );
        return Ok(PipelineOutcome::Superseded { active_job_id });
    }

    if video.status.is_terminal() {
        if video.webhook_enqueued_at.is_none() {
            tracing::warn!(
                video_id = %job.video_id,
                status = %video.status,
                "Video settled without a queued webhook, notifying"
            );
            notify(state, settled_webhook(&video)).await?;
        } else {
            tracing::info!(
                video_id = %job.video_id,
                status = %video.status,
                "Video already settled, skipping job"
            );
        }
        return Ok(PipelineOutcome::Skipped {
            status: video.status,
        });
    }

    tracing::info!(
        video_id = %job.video_id,
        job_id = %job.job_id,
        attempt = attempt.number,
        max_attempts = attempt.max_attempts,
        resumed_from = %video.status,
        "Starting video processing"
    );

    let result = match acquire_workspace(state, job.video_id).await {
        Ok(workspace) => {
            let deadline = state.pipeline.deadline;
            let result = tokio::time::timeout(
                deadline,
                execute(state, job, video.status, workspace.path()),
            )
            .await
            .unwrap_or_else(|_| Err(PipelineError::DeadlineExceeded(deadline)));

            release_workspace(job.video_id, workspace).await;
            result
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(published) => {
            let duration_ms = elapsed_ms(job);
            let screenshot_url = published.screenshot.map(|(url, _)| url);
            metrics::histogram!("processing_duration_seconds").record(duration_ms as f64 / 1000.0);

            notify(
                state,
                WebhookJob {
                    video_id: job.video_id,
                    status: DeliveryStatus::Completed,
                    output_url: screenshot_url.clone(),
                    processing_time_ms: duration_ms,
                    error: None,
                },
            )
            .await?;

            tracing::info!(
                video_id = %job.video_id,
                faces_detected = published.faces,
                duration_ms,
                "Video processing completed"
            );
            Ok(PipelineOutcome::Completed {
                faces_detected: published.faces,
                screenshot_url,
                duration_ms,
            })
        }
        Err(PipelineError::Store(StoreError::Superseded { .. })) => {
            let active_job_id = state
                .store
                .get(job.video_id)
                .await?
                .and_then(|v| v.active_job_id)
                .unwrap_or(job.job_id);
            tracing::info!(
                video_id = %job.video_id,
                job_id = %job.job_id,
                active_job_id = %active_job_id,
                "Job superseded mid-run, abandoning"
            );
            Ok(PipelineOutcome::Superseded { active_job_id })
        }
        Err(err) => {
            if !err.is_retryable() || attempt.is_final() {
                record_failure(state, job, &err).await?;
            } else {
                tracing::warn!(
                    video_id = %job.video_id,
                    attempt = attempt.number,
                    error = %err,
                    "Processing attempt failed, will retry"
                );
            }
            Err(err)
        }
    }
}

/// Webhook for a video that settled on an earlier attempt.
fn settled_webhook(video: &VideoRecord) -> WebhookJob {
    let completed = video.status == VideoStatus::Completed;
    WebhookJob {
        video_id: video.id,
        status: if completed {
            DeliveryStatus::Completed
        } else {
            DeliveryStatus::Failed
        },
        output_url: video.frame_screenshot_url.clone().filter(|_| completed),
        processing_time_ms: video.processing_duration_ms.unwrap_or_default(),
        error: if completed {
            None
        } else {
            video.error_message.clone()
        },
    }
}

async fn acquire_workspace(state: &AppState, video_id: Uuid) -> Result<tempfile::TempDir, PipelineError> {
    let root = state.pipeline.temp_dir.clone();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&root)?;
        tempfile::Builder::new()
            .prefix(&format!("video_{video_id}_"))
            .tempdir_in(&root)
    })
    .await
    .map_err(|e| PipelineError::Task(e.to_string()))?
    .map_err(PipelineError::Workspace)
}

async fn release_workspace(video_id: Uuid, workspace: tempfile::TempDir) {
    let path = workspace.path().to_path_buf();
    let removed = tokio::task::spawn_blocking(move || workspace.close())
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
        .and_then(|closed| closed);
    if let Err(e) = removed {
        tracing::warn!(
            video_id = %video_id,
            path = %path.display(),
            error = %e,
            "Failed to remove workspace"
        );
    }
}

async fn execute(
    state: &AppState,
    job: &ProcessingJob,
    current: VideoStatus,
    workspace: &Path,
) -> Result<Published, PipelineError> {
    let id = job.video_id;
    let options = job.options;

    // A retry that already passed detection stays there; everything else
    // (re-)enters processing.
    if current != VideoStatus::FaceDetectionComplete {
        state
            .store
            .update_fields(
                id,
                VideoUpdate::status(VideoStatus::Processing)
                    .progress(PROGRESS_CLAIMED)
                    .for_job(job.job_id),
            )
            .await?;
    }

    let bytes = state
        .storage
        .fetch(&job.input_url)
        .await
        .map_err(PipelineError::Fetch)?;
    let input = workspace.join(INPUT_FILE);
    tokio::fs::write(&input, &bytes)
        .await
        .map_err(PipelineError::Workspace)?;
    drop(bytes);
    tracing::debug!(video_id = %id, path = %input.display(), "Input media staged");

    let info = state.media.probe(&input).await.map_err(PipelineError::Probe)?;
    tracing::info!(
        video_id = %id,
        duration_secs = info.duration_secs,
        fps = info.fps,
        width = info.width,
        height = info.height,
        total_frames = info.total_frames,
        "Video probed"
    );
    state
        .store
        .update_fields(
            id,
            VideoUpdate::default()
                .total_frames(info.total_frames)
                .for_job(job.job_id),
        )
        .await?;

    let at = media::frame_timestamp(options.frame_index, &info);
    let frame_path = workspace.join(format!("frame_{}.jpg", options.frame_index));
    state
        .media
        .extract_frame(&input, &frame_path, at, FRAME_WIDTH, FRAME_HEIGHT)
        .await
        .map_err(PipelineError::Extract)?;
    tracing::debug!(video_id = %id, frame_index = options.frame_index, timestamp = %at, "Frame extracted");

    let frame = load_frame(frame_path).await?;
    let faces = state.detector.detect(&frame).await.map_err(PipelineError::Detect)?;
    tracing::info!(video_id = %id, faces_detected = faces.len(), "Face detection completed");

    let records: Vec<FaceRecord> = faces.iter().map(FaceRecord::from).collect();
    state.store.replace_faces(id, &records).await?;

    let screenshot = if faces.is_empty() {
        None
    } else {
        let jpeg = redact_frame(frame, faces.clone(), options.mode, options.intensity).await?;
        let key = format!(
            "screenshots/video_{id}_frame_{}_{}.jpg",
            options.frame_index,
            options.mode.file_suffix()
        );
        let published = state
            .storage
            .publish(jpeg, &PublishMetadata::jpeg(key))
            .await
            .map_err(PipelineError::Publish)?;
        tracing::info!(video_id = %id, url = %published.locator, mode = %options.mode, "Redacted frame published");
        Some((published.locator, published.delete_handle))
    };

    let mut detected = VideoUpdate::status(VideoStatus::FaceDetectionComplete)
        .progress(PROGRESS_FACES_DETECTED)
        .faces_detected(faces.len() as i32)
        .redaction(options.mode, options.intensity as i32)
        .for_job(job.job_id);
    if let Some((url, handle)) = screenshot.clone() {
        detected = detected.screenshot(url, handle);
    }
    state.store.update_fields(id, detected).await?;

    state
        .store
        .update_fields(
            id,
            VideoUpdate::status(VideoStatus::Completed)
                .progress(PROGRESS_COMPLETED)
                .processed_at(Utc::now())
                .processing_duration_ms(elapsed_ms(job))
                .for_job(job.job_id),
        )
        .await?;

    Ok(Published {
        faces: faces.len(),
        screenshot,
    })
}

async fn load_frame(path: std::path::PathBuf) -> Result<DynamicImage, PipelineError> {
    tokio::task::spawn_blocking(move || image::open(&path))
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
        .map_err(PipelineError::Frame)
}

async fn redact_frame(
    frame: DynamicImage,
    faces: Vec<DetectedFace>,
    mode: RedactionMode,
    intensity: u32,
) -> Result<Vec<u8>, PipelineError> {
    tokio::task::spawn_blocking(move || {
        let redacted = redaction::redact(&frame, &faces, mode, intensity);
        redaction::encode_jpeg(&redacted)
    })
    .await
    .map_err(|e| PipelineError::Task(e.to_string()))?
    .map_err(PipelineError::Redact)
}

fn elapsed_ms(job: &ProcessingJob) -> i64 {
    (Utc::now() - job.accepted_at).num_milliseconds().max(0)
}

/// Mark the video failed and tell the subscriber, unless it already settled.
///
/// Only a failure to queue the webhook is returned, so the job is retried
/// and the next attempt notifies from the settled record.
async fn record_failure(
    state: &AppState,
    job: &ProcessingJob,
    err: &PipelineError,
) -> Result<(), PipelineError> {
    let message = err.to_string();
    let duration_ms = elapsed_ms(job);

    tracing::error!(video_id = %job.video_id, error = %message, "Video processing failed");

    let update = VideoUpdate::status(VideoStatus::Failed)
        .error(message.clone())
        .processing_duration_ms(duration_ms)
        .for_job(job.job_id);
    match state.store.update_fields(job.video_id, update).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => return Ok(()),
        Err(StoreError::Superseded { .. }) => {
            tracing::info!(video_id = %job.video_id, job_id = %job.job_id, "Job superseded, failure not recorded");
            return Ok(());
        }
        Err(StoreError::InvalidTransition { from, .. }) => {
            tracing::warn!(
                video_id = %job.video_id,
                status = %from,
                "Video already settled, failure not recorded"
            );
            return Ok(());
        }
        Err(e) => {
            tracing::error!(video_id = %job.video_id, error = %e, "Failed to record failure status");
        }
    }

    notify(
        state,
        WebhookJob {
            video_id: job.video_id,
            status: DeliveryStatus::Failed,
            output_url: None,
            processing_time_ms: duration_ms,
            error: Some(message),
        },
    )
    .await
    .map(|_| ())
}

/// Enqueue the single webhook job for a terminal outcome and flag the video
/// as notified.
///
/// The enqueue is retried with the webhook queue's backoff before giving up.
async fn notify(state: &AppState, job: WebhookJob) -> Result<JobHandle, PipelineError> {
    let video_id = job.video_id;
    let status = job.status;
    let backoff = state.webhook_queue.settings().backoff;
    let payload = JobPayload::DeliverWebhook(job);

    let mut tries = 1;
    let handle = loop {
        match state
            .webhook_queue
            .enqueue(payload.clone(), EnqueueOptions::default())
            .await
        {
            Ok(handle) => break handle,
            Err(e) if tries < NOTIFY_ENQUEUE_TRIES => {
                let delay = backoff.delay_for(tries);
                tracing::warn!(
                    video_id = %video_id,
                    status = %status,
                    tries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to enqueue webhook job, retrying"
                );
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            Err(e) => {
                tracing::error!(video_id = %video_id, status = %status, tries, error = %e, "Failed to enqueue webhook job");
                return Err(PipelineError::Notify(e));
            }
        }
    };
    tracing::info!(video_id = %video_id, status = %status, job_id = %handle.id, "Webhook job enqueued");

    if let Err(e) = state.store.mark_webhook_enqueued(video_id).await {
        tracing::warn!(video_id = %video_id, error = %e, "Failed to flag webhook as enqueued");
    }
    Ok(handle)
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Video {0} not found")]
    VideoNotFound(Uuid),

    #[error("Workspace I/O failed: {0}")]
    Workspace(std::io::Error),

    #[error("Failed to fetch input media: {0}")]
    Fetch(StorageError),

    #[error("Unreadable media: {0}")]
    Probe(MediaError),

    #[error("Frame extraction failed: {0}")]
    Extract(MediaError),

    #[error("Corrupt frame: {0}")]
    Frame(image::ImageError),

    #[error("Face detection failed: {0}")]
    Detect(DetectorError),

    #[error("Redaction failed: {0}")]
    Redact(RedactionError),

    #[error("Failed to publish redacted frame: {0}")]
    Publish(StorageError),

    #[error("Status store error: {0}")]
    Store(#[from] StoreError),

    #[error("Processing exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Failed to enqueue webhook job: {0}")]
    Notify(QueueError),
}

impl PipelineError {
    /// Transient infrastructure failures are retried; malformed input,
    /// detection and redaction failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Workspace(_)
            | PipelineError::Fetch(_)
            | PipelineError::Publish(_)
            | PipelineError::Notify(_) => true,
            PipelineError::Store(e) => e.is_transient(),
            PipelineError::VideoNotFound(_)
            | PipelineError::Probe(_)
            | PipelineError::Extract(_)
            | PipelineError::Frame(_)
            | PipelineError::Detect(_)
            | PipelineError::Redact(_)
            | PipelineError::DeadlineExceeded(_)
            | PipelineError::Task(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert!(PipelineError::Workspace(std::io::Error::other("disk")).is_retryable());
        assert!(PipelineError::Fetch(StorageError::Config("x".into())).is_retryable());
        assert!(PipelineError::Publish(StorageError::Status { status: 503, key: "k".into() }).is_retryable());
        assert!(!PipelineError::Probe(MediaError::Malformed("zero-duration video".into())).is_retryable());
        assert!(!PipelineError::Detect(DetectorError::ModelLoad("x".into())).is_retryable());
        assert!(!PipelineError::DeadlineExceeded(Duration::from_secs(1)).is_retryable());
        assert!(!PipelineError::VideoNotFound(Uuid::nil()).is_retryable());
        assert!(!PipelineError::Store(StoreError::NotFound(Uuid::nil())).is_retryable());
        assert!(!PipelineError::Store(StoreError::Superseded {
            id: Uuid::nil(),
            job_id: Uuid::nil(),
        })
        .is_retryable());
        assert!(PipelineError::Notify(QueueError::LeaseLost(Uuid::nil())).is_retryable());
    }

    #[test]
    fn test_final_attempt() {
        assert!(!Attempt { number: 1, max_attempts: 3 }.is_final());
        assert!(Attempt { number: 3, max_attempts: 3 }.is_final());
    }
}
