use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::face::FaceRecord;
use crate::models::job::ProcessingOptions;
use crate::models::video::{NewVideo, VideoRecord, VideoStatus, VideoUpdate};

pub mod queries;

pub use queries::PgVideoStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persisted video lifecycle records and their face detections.
///
/// Every mutation is a single-row conditional update keyed by video id.
/// Status changes are only applied when the current status is one of the
/// target's allowed predecessors.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<VideoRecord>, StoreError>;

    async fn create(&self, video: NewVideo) -> Result<VideoRecord, StoreError>;

    /// Apply the set fields of `update`. Progress never decreases.
    async fn update_fields(&self, id: Uuid, update: VideoUpdate) -> Result<VideoRecord, StoreError>;

    /// Put a settled video back to `uploaded` with progress 0, no screenshot
    /// and the new options, owned by `job_id`. Refused while a job may still
    /// be running.
    async fn reset_for_reprocess(
        &self,
        id: Uuid,
        options: &ProcessingOptions,
        job_id: Uuid,
    ) -> Result<VideoRecord, StoreError>;

    /// Record that the terminal webhook of the current run is queued.
    async fn mark_webhook_enqueued(&self, id: Uuid) -> Result<(), StoreError>;

    /// Atomically replace every face record of the video.
    async fn replace_faces(&self, id: Uuid, faces: &[FaceRecord]) -> Result<(), StoreError>;

    /// Returns the number of records removed.
    async fn delete_faces(&self, id: Uuid) -> Result<u64, StoreError>;

    /// Face records ordered by face index.
    async fn list_faces(&self, id: Uuid) -> Result<Vec<FaceRecord>, StoreError>;

    /// Callback URL of the user owning the video, if one is configured.
    async fn callback_url(&self, id: Uuid) -> Result<Option<String>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Video {0} not found")]
    NotFound(Uuid),

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: VideoStatus, to: VideoStatus },

    #[error("Job {job_id} no longer owns video {id}")]
    Superseded { id: Uuid, job_id: Uuid },

    #[error("Video {id} cannot be reprocessed while {status}")]
    ResetRefused { id: Uuid, status: VideoStatus },

    #[error("Corrupt column {column}: {value}")]
    Decode { column: &'static str, value: String },
}

impl StoreError {
    /// Whether the failure comes from the infrastructure rather than the data.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}
