use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::video::{RedactionMode, DEFAULT_REDACTION_INTENSITY};

/// Per-job redaction options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq)]
pub struct ProcessingOptions {
    #[garde(range(min = 1))]
    #[serde(default = "default_frame_index")]
    pub frame_index: u32,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_intensity")]
    pub intensity: u32,

    #[garde(skip)]
    #[serde(default)]
    pub mode: RedactionMode,
}

fn default_frame_index() -> u32 {
    1
}

fn default_intensity() -> u32 {
    DEFAULT_REDACTION_INTENSITY as u32
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            frame_index: default_frame_index(),
            intensity: default_intensity(),
            mode: RedactionMode::default(),
        }
    }
}

/// Unit of work for the processing queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingJob {
    /// Identity of this run. Only the job recorded as active on the video
    /// may advance it.
    pub job_id: Uuid,
    pub video_id: Uuid,
    pub input_url: String,
    #[serde(default)]
    pub options: ProcessingOptions,
    /// When the job was accepted; processing duration is measured from here.
    pub accepted_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn new(video_id: Uuid, input_url: impl Into<String>, options: ProcessingOptions) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            video_id,
            input_url: input_url.into(),
            options,
            accepted_at: Utc::now(),
        }
    }
}

/// Terminal outcome reported to the subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Completed,
    Failed,
}

/// Unit of work for the webhook queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookJob {
    pub video_id: Uuid,
    pub status: DeliveryStatus,
    pub output_url: Option<String>,
    pub processing_time_ms: i64,
    pub error: Option<String>,
}

/// Every payload either queue can carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    ProcessVideo(ProcessingJob),
    DeliverWebhook(WebhookJob),
}

impl JobPayload {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobPayload::ProcessVideo(_) => "process_video",
            JobPayload::DeliverWebhook(_) => "deliver_webhook",
        }
    }

    pub fn video_id(&self) -> Uuid {
        match self {
            JobPayload::ProcessVideo(job) => job.video_id,
            JobPayload::DeliverWebhook(job) => job.video_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults_when_missing() {
        let options: ProcessingOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ProcessingOptions::default());
        assert_eq!(options.frame_index, 1);
        assert_eq!(options.intensity, 25);
        assert_eq!(options.mode, RedactionMode::Blur);
    }

    #[test]
    fn test_options_validation_bounds() {
        let ok = ProcessingOptions::default();
        assert!(ok.validate().is_ok());

        let zero_frame = ProcessingOptions { frame_index: 0, ..ok };
        assert!(zero_frame.validate().is_err());

        let too_intense = ProcessingOptions { intensity: 101, ..ok };
        assert!(too_intense.validate().is_err());
    }

    #[test]
    fn test_payload_is_tagged() {
        let payload = JobPayload::DeliverWebhook(WebhookJob {
            video_id: Uuid::nil(),
            status: DeliveryStatus::Failed,
            output_url: None,
            processing_time_ms: 12,
            error: Some("boom".to_string()),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "deliver_webhook");
        assert_eq!(json["status"], "failed");
        assert_eq!(payload.job_type(), "deliver_webhook");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
