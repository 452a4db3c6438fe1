//! Producer side: registering videos and (re)queueing processing jobs.

use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::StoreError;
use crate::models::job::{JobPayload, ProcessingJob, ProcessingOptions};
use crate::models::video::{NewVideo, VideoRecord};
use crate::services::queue::{EnqueueOptions, JobHandle, JobQueue, QueueError};

/// Validate and enqueue a processing job.
pub async fn enqueue_processing_job(
    queue: &dyn JobQueue,
    job: ProcessingJob,
) -> Result<JobHandle, VideoServiceError> {
    job.options
        .validate()
        .map_err(|e| VideoServiceError::InvalidOptions(e.to_string()))?;
    if job.input_url.trim().is_empty() {
        return Err(VideoServiceError::InvalidOptions(
            "input locator is empty".to_string(),
        ));
    }

    let video_id = job.video_id;
    let handle = queue
        .enqueue(JobPayload::ProcessVideo(job), EnqueueOptions::default())
        .await?;

    metrics::counter!("processing_jobs_total").increment(1);
    tracing::info!(video_id = %video_id, job_id = %handle.id, queue = %handle.queue, "Processing job enqueued");
    Ok(handle)
}

/// Create the video record and enqueue its first processing job.
pub async fn register_video(
    state: &AppState,
    video: NewVideo,
) -> Result<(VideoRecord, JobHandle), VideoServiceError> {
    video
        .options
        .validate()
        .map_err(|e| VideoServiceError::InvalidOptions(e.to_string()))?;

    let job = ProcessingJob::new(video.id, video.input_url.clone(), video.options);
    let record = state.store.create(video.with_active_job(job.job_id)).await?;
    let handle = enqueue_processing_job(state.processing_queue.as_ref(), job).await?;
    Ok((record, handle))
}

/// Reset a settled video and queue it again with new options.
///
/// Prior face records and the published screenshot are removed before the
/// new job is enqueued. The new job becomes the video's active job, so a
/// job queued earlier and not yet run is skipped.
pub async fn reprocess_video(
    state: &AppState,
    video_id: Uuid,
    options: ProcessingOptions,
) -> Result<(VideoRecord, JobHandle), VideoServiceError> {
    options
        .validate()
        .map_err(|e| VideoServiceError::InvalidOptions(e.to_string()))?;

    let previous = state
        .store
        .get(video_id)
        .await?
        .ok_or(StoreError::NotFound(video_id))?;
    if !previous.status.can_reset() {
        return Err(StoreError::ResetRefused {
            id: video_id,
            status: previous.status,
        }
        .into());
    }

    let job = ProcessingJob::new(video_id, previous.input_url.clone(), options);
    let record = state
        .store
        .reset_for_reprocess(video_id, &options, job.job_id)
        .await?;
    let removed = state.store.delete_faces(video_id).await?;

    if let Some(handle) = previous.frame_screenshot_handle.as_deref() {
        if let Err(e) = state.storage.delete(handle).await {
            tracing::warn!(video_id = %video_id, handle, error = %e, "Failed to delete previous screenshot");
        }
    }

    tracing::info!(video_id = %video_id, job_id = %job.job_id, faces_removed = removed, "Video reset for reprocessing");

    let handle = enqueue_processing_job(state.processing_queue.as_ref(), job).await?;
    Ok((record, handle))
}

#[derive(Debug, thiserror::Error)]
pub enum VideoServiceError {
    #[error("Invalid processing options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
