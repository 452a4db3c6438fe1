use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::queue::{BackoffPolicy, QueueSettings, DEFAULT_DEAD_LETTER_RETENTION};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Operations server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus listener of the worker process.
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for both job queues
    pub redis_url: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// Public base URL published frames are served from
    pub r2_public_url: String,

    /// Face detection inference service
    pub detector_url: String,

    #[serde(default)]
    pub detector_api_token: Option<String>,

    #[serde(default = "default_detector_timeout_secs")]
    pub detector_timeout_secs: u64,

    /// Minimum confidence for a detection to count as a face
    #[serde(default = "default_face_min_confidence")]
    pub face_min_confidence: f32,

    /// Shared HMAC secret for webhook signatures
    pub webhook_secret: String,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// Parent directory of per-job workspaces; system temp dir when unset
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    #[serde(default = "default_processing_deadline_secs")]
    pub processing_deadline_secs: u64,

    #[serde(default = "default_queue_key_prefix")]
    pub queue_key_prefix: String,

    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,

    #[serde(default = "default_processing_max_attempts")]
    pub processing_max_attempts: u32,

    #[serde(default = "default_processing_backoff_base_ms")]
    pub processing_backoff_base_ms: u64,

    #[serde(default = "default_processing_backoff_max_ms")]
    pub processing_backoff_max_ms: u64,

    #[serde(default = "default_processing_lease_secs")]
    pub processing_lease_secs: u64,

    #[serde(default = "default_processing_concurrency")]
    pub processing_concurrency: usize,

    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,

    #[serde(default = "default_webhook_backoff_base_ms")]
    pub webhook_backoff_base_ms: u64,

    #[serde(default = "default_webhook_backoff_max_ms")]
    pub webhook_backoff_max_ms: u64,

    #[serde(default = "default_webhook_lease_secs")]
    pub webhook_lease_secs: u64,

    #[serde(default = "default_webhook_concurrency")]
    pub webhook_concurrency: usize,

    /// Dead letters kept per queue
    #[serde(default = "default_dead_letter_retention")]
    pub dead_letter_retention: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_detector_timeout_secs() -> u64 {
    30
}

fn default_face_min_confidence() -> f32 {
    0.5
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_processing_deadline_secs() -> u64 {
    600
}

fn default_queue_key_prefix() -> String {
    "face_redact".to_string()
}

fn default_queue_poll_interval_ms() -> u64 {
    1000
}

fn default_processing_max_attempts() -> u32 {
    3
}

fn default_processing_backoff_base_ms() -> u64 {
    2000
}

fn default_processing_backoff_max_ms() -> u64 {
    60_000
}

fn default_processing_lease_secs() -> u64 {
    900
}

fn default_processing_concurrency() -> usize {
    2
}

fn default_webhook_max_attempts() -> u32 {
    5
}

fn default_webhook_backoff_base_ms() -> u64 {
    1000
}

fn default_webhook_backoff_max_ms() -> u64 {
    30_000
}

fn default_webhook_lease_secs() -> u64 {
    60
}

fn default_webhook_concurrency() -> usize {
    4
}

fn default_dead_letter_retention() -> usize {
    DEFAULT_DEAD_LETTER_RETENTION
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Reject settings the worker cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processing_max_attempts == 0 || self.webhook_max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".into()));
        }
        if self.processing_concurrency == 0 || self.webhook_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.processing_backoff_base_ms > self.processing_backoff_max_ms
            || self.webhook_backoff_base_ms > self.webhook_backoff_max_ms
        {
            return Err(ConfigError::Invalid(
                "backoff base delay exceeds its cap".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.face_min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "face confidence threshold {} is outside [0, 1]",
                self.face_min_confidence
            )));
        }
        if self.processing_deadline_secs == 0
            || self.processing_deadline_secs >= self.processing_lease_secs
        {
            return Err(ConfigError::Invalid(format!(
                "processing deadline ({}s) must be non-zero and shorter than the processing lease ({}s)",
                self.processing_deadline_secs, self.processing_lease_secs
            )));
        }
        if self.webhook_timeout_secs == 0 || self.webhook_timeout_secs >= self.webhook_lease_secs {
            return Err(ConfigError::Invalid(format!(
                "webhook timeout ({}s) must be non-zero and shorter than the webhook lease ({}s)",
                self.webhook_timeout_secs, self.webhook_lease_secs
            )));
        }
        if self.dead_letter_retention == 0 {
            return Err(ConfigError::Invalid(
                "dead letter retention must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn processing_queue_settings(&self) -> QueueSettings {
        QueueSettings {
            name: QueueSettings::processing().name,
            max_attempts: self.processing_max_attempts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.processing_backoff_base_ms),
                Duration::from_millis(self.processing_backoff_max_ms),
            ),
            visibility_timeout: Duration::from_secs(self.processing_lease_secs),
            poll_interval: self.poll_interval(),
            dead_letter_retention: self.dead_letter_retention,
        }
    }

    pub fn webhook_queue_settings(&self) -> QueueSettings {
        QueueSettings {
            name: QueueSettings::webhook().name,
            max_attempts: self.webhook_max_attempts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.webhook_backoff_base_ms),
                Duration::from_millis(self.webhook_backoff_max_ms),
            ),
            visibility_timeout: Duration::from_secs(self.webhook_lease_secs),
            poll_interval: self.poll_interval(),
            dead_letter_retention: self.dead_letter_retention,
        }
    }

    pub fn processing_deadline(&self) -> Duration {
        Duration::from_secs(self.processing_deadline_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs(self.detector_timeout_secs)
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
