use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::job::ProcessingOptions;

/// Lifecycle of a video through the processing pipeline.
///
/// Forward path: `uploaded → processing → face_detection_complete → completed`,
/// with `failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VideoStatus {
    Uploaded,
    Processing,
    FaceDetectionComplete,
    Completed,
    Failed,
}

impl VideoStatus {
    pub const ALL: [VideoStatus; 5] = [
        VideoStatus::Uploaded,
        VideoStatus::Processing,
        VideoStatus::FaceDetectionComplete,
        VideoStatus::Completed,
        VideoStatus::Failed,
    ];

    /// States a record may be in for a pipeline update to move it into `self`.
    ///
    /// `processing` and `face_detection_complete` accept themselves so a
    /// retried attempt can re-enter the stage it was interrupted in.
    pub fn allowed_predecessors(self) -> &'static [VideoStatus] {
        match self {
            VideoStatus::Uploaded => &[],
            VideoStatus::Processing => &[VideoStatus::Uploaded, VideoStatus::Processing],
            VideoStatus::FaceDetectionComplete => {
                &[VideoStatus::Processing, VideoStatus::FaceDetectionComplete]
            }
            VideoStatus::Completed => &[VideoStatus::FaceDetectionComplete],
            VideoStatus::Failed => &[
                VideoStatus::Uploaded,
                VideoStatus::Processing,
                VideoStatus::FaceDetectionComplete,
            ],
        }
    }

    pub fn can_transition_to(self, next: VideoStatus) -> bool {
        next.allowed_predecessors().contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VideoStatus::Completed | VideoStatus::Failed)
    }

    /// Reprocessing is refused while a job may still be running for the video.
    pub fn can_reset(self) -> bool {
        matches!(
            self,
            VideoStatus::Uploaded | VideoStatus::Completed | VideoStatus::Failed
        )
    }
}

/// How detected faces are obscured.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
pub enum RedactionMode {
    #[default]
    #[serde(rename = "blur")]
    #[strum(to_string = "blur")]
    Blur,
    #[serde(rename = "black-bar", alias = "blackbar")]
    #[strum(to_string = "black-bar", serialize = "blackbar")]
    BlackBar,
}

impl RedactionMode {
    /// Suffix used when naming published redacted frames.
    pub fn file_suffix(self) -> &'static str {
        match self {
            RedactionMode::Blur => "blurred",
            RedactionMode::BlackBar => "blackbar",
        }
    }
}

pub const DEFAULT_REDACTION_INTENSITY: i32 = 25;

/// Persisted lifecycle record of one video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub filename: String,
    pub input_url: String,
    pub output_url: Option<String>,
    pub status: VideoStatus,
    pub upload_progress: i32,
    pub processing_progress: i32,
    pub total_frames: i64,
    pub faces_detected: i32,
    pub frame_index: i32,
    pub frame_screenshot_url: Option<String>,
    pub frame_screenshot_handle: Option<String>,
    pub redaction_intensity: i32,
    pub redaction_mode: RedactionMode,
    pub error_message: Option<String>,
    pub processing_duration_ms: Option<i64>,
    /// Job currently entitled to advance this record.
    pub active_job_id: Option<Uuid>,
    /// Set once the terminal webhook for the current run is queued.
    pub webhook_enqueued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Fields supplied when a video is registered.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub filename: String,
    pub input_url: String,
    pub upload_progress: i32,
    pub options: ProcessingOptions,
    pub active_job_id: Option<Uuid>,
}

impl NewVideo {
    pub fn new(user_id: Option<Uuid>, filename: impl Into<String>, input_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            filename: filename.into(),
            input_url: input_url.into(),
            upload_progress: 100,
            options: ProcessingOptions::default(),
            active_job_id: None,
        }
    }

    pub fn with_options(mut self, options: ProcessingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_active_job(mut self, job_id: Uuid) -> Self {
        self.active_job_id = Some(job_id);
        self
    }
}

/// Partial update applied by the pipeline. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoUpdate {
    pub status: Option<VideoStatus>,
    pub processing_progress: Option<i32>,
    pub total_frames: Option<i64>,
    pub faces_detected: Option<i32>,
    pub frame_screenshot_url: Option<String>,
    pub frame_screenshot_handle: Option<String>,
    pub redaction_intensity: Option<i32>,
    pub redaction_mode: Option<RedactionMode>,
    pub error_message: Option<String>,
    pub processing_duration_ms: Option<i64>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Reject the update unless this job is still the active one.
    pub expected_job: Option<Uuid>,
}

impl VideoUpdate {
    pub fn status(status: VideoStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(mut self, progress: i32) -> Self {
        self.processing_progress = Some(progress.clamp(0, 100));
        self
    }

    pub fn total_frames(mut self, frames: i64) -> Self {
        self.total_frames = Some(frames);
        self
    }

    pub fn faces_detected(mut self, count: i32) -> Self {
        self.faces_detected = Some(count);
        self
    }

    pub fn screenshot(mut self, url: String, handle: String) -> Self {
        self.frame_screenshot_url = Some(url);
        self.frame_screenshot_handle = Some(handle);
        self
    }

    pub fn redaction(mut self, mode: RedactionMode, intensity: i32) -> Self {
        self.redaction_mode = Some(mode);
        self.redaction_intensity = Some(intensity);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn processing_duration_ms(mut self, ms: i64) -> Self {
        self.processing_duration_ms = Some(ms);
        self
    }

    pub fn processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn for_job(mut self, job_id: Uuid) -> Self {
        self.expected_job = Some(job_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_forward_path_is_allowed() {
        assert!(VideoStatus::Uploaded.can_transition_to(VideoStatus::Processing));
        assert!(VideoStatus::Processing.can_transition_to(VideoStatus::FaceDetectionComplete));
        assert!(VideoStatus::FaceDetectionComplete.can_transition_to(VideoStatus::Completed));
    }

    #[test]
    fn test_failed_reachable_only_from_non_terminal() {
        for from in VideoStatus::ALL {
            assert_eq!(
                from.can_transition_to(VideoStatus::Failed),
                !from.is_terminal(),
                "{from} -> failed"
            );
        }
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        assert!(!VideoStatus::Completed.can_transition_to(VideoStatus::Processing));
        assert!(!VideoStatus::FaceDetectionComplete.can_transition_to(VideoStatus::Processing));
        assert!(!VideoStatus::Processing.can_transition_to(VideoStatus::Completed));
        assert!(!VideoStatus::Uploaded.can_transition_to(VideoStatus::FaceDetectionComplete));
        assert!(!VideoStatus::Failed.can_transition_to(VideoStatus::Completed));
        for from in VideoStatus::ALL {
            assert!(!from.can_transition_to(VideoStatus::Uploaded));
        }
    }

    #[test]
    fn test_reachable_set_is_exactly_the_state_machine() {
        let mut edges = Vec::new();
        for from in VideoStatus::ALL {
            for to in VideoStatus::ALL {
                if from != to && from.can_transition_to(to) {
                    edges.push((from, to));
                }
            }
        }
        assert_eq!(
            edges,
            vec![
                (VideoStatus::Uploaded, VideoStatus::Processing),
                (VideoStatus::Uploaded, VideoStatus::Failed),
                (VideoStatus::Processing, VideoStatus::FaceDetectionComplete),
                (VideoStatus::Processing, VideoStatus::Failed),
                (VideoStatus::FaceDetectionComplete, VideoStatus::Completed),
                (VideoStatus::FaceDetectionComplete, VideoStatus::Failed),
            ]
        );
    }

    #[test]
    fn test_status_text_representation() {
        assert_eq!(VideoStatus::FaceDetectionComplete.to_string(), "face_detection_complete");
        assert_eq!(
            VideoStatus::from_str("face_detection_complete").unwrap(),
            VideoStatus::FaceDetectionComplete
        );
    }

    #[test]
    fn test_mode_accepts_legacy_alias() {
        assert_eq!(RedactionMode::from_str("blackbar").unwrap(), RedactionMode::BlackBar);
        assert_eq!(RedactionMode::from_str("black-bar").unwrap(), RedactionMode::BlackBar);
        assert_eq!(RedactionMode::BlackBar.to_string(), "black-bar");
        let parsed: RedactionMode = serde_json::from_str("\"blackbar\"").unwrap();
        assert_eq!(parsed, RedactionMode::BlackBar);
        assert_eq!(serde_json::to_string(&RedactionMode::Blur).unwrap(), "\"blur\"");
    }

    #[test]
    fn test_update_progress_is_clamped() {
        let update = VideoUpdate::status(VideoStatus::Processing).progress(140);
        assert_eq!(update.processing_progress, Some(100));
    }
}
