use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{StoreError, VideoStore};
use crate::models::face::FaceRecord;
use crate::models::job::ProcessingOptions;
use crate::models::video::{
    NewVideo, RedactionMode, VideoRecord, VideoStatus, VideoUpdate,
};

const VIDEO_COLUMNS: &str = "id, user_id, filename, input_url, output_url, status, \
     upload_progress, processing_progress, total_frames, faces_detected, frame_index, \
     frame_screenshot_url, frame_screenshot_handle, redaction_intensity, redaction_mode, \
     error_message, processing_duration_ms, active_job_id, webhook_enqueued_at, \
     created_at, updated_at, processed_at";

/// PostgreSQL-backed [`VideoStore`].
#[derive(Clone)]
pub struct PgVideoStore {
    pool: PgPool,
}

impl PgVideoStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_list(statuses: &[VideoStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

fn video_from_row(row: &PgRow) -> Result<VideoRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = VideoStatus::from_str(&status).map_err(|_| StoreError::Decode {
        column: "status",
        value: status.clone(),
    })?;
    let mode: String = row.try_get("redaction_mode")?;
    let redaction_mode = RedactionMode::from_str(&mode).map_err(|_| StoreError::Decode {
        column: "redaction_mode",
        value: mode.clone(),
    })?;

    Ok(VideoRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        filename: row.try_get("filename")?,
        input_url: row.try_get("input_url")?,
        output_url: row.try_get("output_url")?,
        status,
        upload_progress: row.try_get("upload_progress")?,
        processing_progress: row.try_get("processing_progress")?,
        total_frames: row.try_get("total_frames")?,
        faces_detected: row.try_get("faces_detected")?,
        frame_index: row.try_get("frame_index")?,
        frame_screenshot_url: row.try_get("frame_screenshot_url")?,
        frame_screenshot_handle: row.try_get("frame_screenshot_handle")?,
        redaction_intensity: row.try_get("redaction_intensity")?,
        redaction_mode,
        error_message: row.try_get("error_message")?,
        processing_duration_ms: row.try_get("processing_duration_ms")?,
        active_job_id: row.try_get("active_job_id")?,
        webhook_enqueued_at: row.try_get("webhook_enqueued_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn face_from_row(row: &PgRow) -> Result<FaceRecord, StoreError> {
    Ok(FaceRecord {
        face_index: row.try_get("face_index")?,
        x: row.try_get("x")?,
        y: row.try_get("y")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        confidence: row.try_get("confidence")?,
    })
}

impl PgVideoStore {
    /// Turn a zero-row conditional update into the reason it matched nothing.
    async fn explain_rejection(&self, id: Uuid, update: &VideoUpdate) -> StoreError {
        let current = match self.get(id).await {
            Ok(Some(current)) => current,
            Ok(None) => return StoreError::NotFound(id),
            Err(e) => return e,
        };
        if let (Some(job_id), Some(active)) = (update.expected_job, current.active_job_id) {
            if job_id != active {
                return StoreError::Superseded { id, job_id };
            }
        }
        match update.status {
            Some(to) => StoreError::InvalidTransition {
                from: current.status,
                to,
            },
            None => StoreError::NotFound(id),
        }
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    async fn get(&self, id: Uuid) -> Result<Option<VideoRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(video_from_row).transpose()
    }

    async fn create(&self, video: NewVideo) -> Result<VideoRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO videos (id, user_id, filename, input_url, status, upload_progress, \
                                 frame_index, redaction_intensity, redaction_mode, active_job_id) \
             VALUES ($1, $2, $3, $4, 'uploaded', $5, $6, $7, $8, $9) \
             RETURNING {VIDEO_COLUMNS}"
        ))
        .bind(video.id)
        .bind(video.user_id)
        .bind(&video.filename)
        .bind(&video.input_url)
        .bind(video.upload_progress.clamp(0, 100))
        .bind(video.options.frame_index as i32)
        .bind(video.options.intensity as i32)
        .bind(video.options.mode.to_string())
        .bind(video.active_job_id)
        .fetch_one(&self.pool)
        .await?;

        video_from_row(&row)
    }

    async fn update_fields(&self, id: Uuid, update: VideoUpdate) -> Result<VideoRecord, StoreError> {
        let predecessors = update
            .status
            .map(|s| status_list(s.allowed_predecessors()))
            .unwrap_or_default();

        let row = sqlx::query(&format!(
            "UPDATE videos SET \
                 status = COALESCE($2, status), \
                 processing_progress = GREATEST(processing_progress, COALESCE($3, processing_progress)), \
                 total_frames = COALESCE($4, total_frames), \
                 faces_detected = COALESCE($5, faces_detected), \
                 frame_screenshot_url = COALESCE($6, frame_screenshot_url), \
                 frame_screenshot_handle = COALESCE($7, frame_screenshot_handle), \
                 redaction_intensity = COALESCE($8, redaction_intensity), \
                 redaction_mode = COALESCE($9, redaction_mode), \
                 error_message = COALESCE($10, error_message), \
                 processing_duration_ms = COALESCE($11, processing_duration_ms), \
                 processed_at = COALESCE($12, processed_at), \
                 updated_at = NOW() \
             WHERE id = $1 AND ($2::text IS NULL OR status = ANY($13)) \
               AND ($14::uuid IS NULL OR active_job_id IS NULL OR active_job_id = $14) \
             RETURNING {VIDEO_COLUMNS}"
        ))
        .bind(id)
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.processing_progress)
        .bind(update.total_frames)
        .bind(update.faces_detected)
        .bind(update.frame_screenshot_url.clone())
        .bind(update.frame_screenshot_handle.clone())
        .bind(update.redaction_intensity)
        .bind(update.redaction_mode.map(|m| m.to_string()))
        .bind(update.error_message.clone())
        .bind(update.processing_duration_ms)
        .bind(update.processed_at)
        .bind(predecessors)
        .bind(update.expected_job)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => video_from_row(&row),
            None => Err(self.explain_rejection(id, &update).await),
        }
    }

    async fn reset_for_reprocess(
        &self,
        id: Uuid,
        options: &ProcessingOptions,
        job_id: Uuid,
    ) -> Result<VideoRecord, StoreError> {
        let resettable: Vec<String> = VideoStatus::ALL
            .iter()
            .filter(|s| s.can_reset())
            .map(|s| s.to_string())
            .collect();

        let row = sqlx::query(&format!(
            "UPDATE videos SET \
                 status = 'uploaded', \
                 processing_progress = 0, \
                 total_frames = 0, \
                 faces_detected = 0, \
                 frame_screenshot_url = NULL, \
                 frame_screenshot_handle = NULL, \
                 error_message = NULL, \
                 processing_duration_ms = NULL, \
                 processed_at = NULL, \
                 frame_index = $2, \
                 redaction_intensity = $3, \
                 redaction_mode = $4, \
                 active_job_id = $6, \
                 webhook_enqueued_at = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = ANY($5) \
             RETURNING {VIDEO_COLUMNS}"
        ))
        .bind(id)
        .bind(options.frame_index as i32)
        .bind(options.intensity as i32)
        .bind(options.mode.to_string())
        .bind(resettable)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => video_from_row(&row),
            None => match self.get(id).await? {
                Some(current) => Err(StoreError::ResetRefused {
                    id,
                    status: current.status,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn mark_webhook_enqueued(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE videos SET webhook_enqueued_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn replace_faces(&self, id: Uuid, faces: &[FaceRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM faces WHERE video_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for face in faces {
            sqlx::query(
                "INSERT INTO faces (video_id, face_index, x, y, width, height, confidence) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(id)
            .bind(face.face_index)
            .bind(face.x)
            .bind(face.y)
            .bind(face.width)
            .bind(face.height)
            .bind(face.confidence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_faces(&self, id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM faces WHERE video_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_faces(&self, id: Uuid) -> Result<Vec<FaceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT face_index, x, y, width, height, confidence \
             FROM faces WHERE video_id = $1 ORDER BY face_index",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(face_from_row).collect()
    }

    async fn callback_url(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let url: Option<Option<String>> = sqlx::query_scalar(
            "SELECT u.webhook_url FROM videos v JOIN users u ON u.id = v.user_id WHERE v.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(url.flatten().filter(|u| !u.trim().is_empty()))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
