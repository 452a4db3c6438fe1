use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db::{PgVideoStore, VideoStore};
use crate::services::{
    detector::{DetectorError, FaceDetector, RemoteModelLoader},
    media::{FfmpegToolkit, MediaToolkit},
    queue::{JobQueue, QueueError, RedisQueue},
    storage::{MediaStorage, R2Client, StorageError},
    webhook::{WebhookClient, WebhookError},
};

/// Pipeline knobs that do not belong to any single collaborator.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Parent directory of per-job workspaces.
    pub temp_dir: PathBuf,
    /// Wall-clock bound on one processing attempt.
    pub deadline: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            deadline: Duration::from_secs(600),
        }
    }
}

/// Shared state passed to workers and route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VideoStore>,
    pub storage: Arc<dyn MediaStorage>,
    pub media: Arc<dyn MediaToolkit>,
    pub detector: Arc<FaceDetector>,
    pub processing_queue: Arc<dyn JobQueue>,
    pub webhook_queue: Arc<dyn JobQueue>,
    pub webhooks: Arc<WebhookClient>,
    pub pipeline: PipelineSettings,
}

impl AppState {
    /// Both queues, processing first.
    pub fn queues(&self) -> [&Arc<dyn JobQueue>; 2] {
        [&self.processing_queue, &self.webhook_queue]
    }

    pub fn queue_by_name(&self, name: &str) -> Option<&Arc<dyn JobQueue>> {
        self.queues().into_iter().find(|q| q.name() == name)
    }
}

impl AppState {
    /// Wire the production collaborators from configuration.
    pub fn from_config(config: &AppConfig, pool: PgPool) -> Result<Self, StartupError> {
        let storage = R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
            &config.r2_public_url,
        )?;

        let loader = RemoteModelLoader::new(
            &config.detector_url,
            config.detector_api_token.clone(),
            config.detector_timeout(),
        )?;
        let detector = FaceDetector::new(Arc::new(loader), config.face_min_confidence);

        let processing_queue = RedisQueue::new(
            &config.redis_url,
            &config.queue_key_prefix,
            config.processing_queue_settings(),
        )?;
        let webhook_queue = RedisQueue::new(
            &config.redis_url,
            &config.queue_key_prefix,
            config.webhook_queue_settings(),
        )?;

        let webhooks = WebhookClient::new(config.webhook_secret.clone(), config.webhook_timeout())?;

        Ok(Self {
            store: Arc::new(PgVideoStore::new(pool)),
            storage: Arc::new(storage),
            media: Arc::new(FfmpegToolkit::default()),
            detector: Arc::new(detector),
            processing_queue: Arc::new(processing_queue),
            webhook_queue: Arc::new(webhook_queue),
            webhooks: Arc::new(webhooks),
            pipeline: PipelineSettings {
                temp_dir: config.temp_root(),
                deadline: config.processing_deadline(),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Storage client: {0}")]
    Storage(#[from] StorageError),

    #[error("Face detector: {0}")]
    Detector(#[from] DetectorError),

    #[error("Job queue: {0}")]
    Queue(#[from] QueueError),

    #[error("Webhook client: {0}")]
    Webhook(#[from] WebhookError),
}
