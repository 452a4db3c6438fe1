//! In-process doubles for every pipeline collaborator, plus helpers that
//! drive the queues until they are drained.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use face_redact_pipeline::{
    app_state::{AppState, PipelineSettings},
    db::{StoreError, VideoStore},
    models::face::FaceRecord,
    models::job::{JobPayload, ProcessingOptions},
    models::video::{NewVideo, VideoRecord, VideoStatus, VideoUpdate},
    services::{
        detector::{DetectorError, FaceDetector, FaceModel, ModelLoader, RawFace},
        media::{FrameTimestamp, MediaError, MediaToolkit, VideoInfo},
        queue::{
            BackoffPolicy, DeadLetter, EnqueueOptions, JobFailure, JobHandle, JobQueue, Lease,
            MemoryQueue, NackOutcome, QueueDepth, QueueError, QueueSettings,
        },
        storage::{MediaStorage, PublishMetadata, PublishedObject, StorageError},
        webhook::WebhookClient,
        worker::{self, Settlement, WorkerRole},
    },
};
use image::{Rgb, RgbImage};
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

// ---------------------------------------------------------------------------
// Status store

#[derive(Default)]
struct StoreInner {
    videos: HashMap<Uuid, VideoRecord>,
    faces: HashMap<Uuid, Vec<FaceRecord>>,
    callbacks: HashMap<Uuid, String>,
}

/// Status store with the same transition rules as the Postgres store.
#[derive(Default)]
pub struct MemoryVideoStore {
    inner: Mutex<StoreInner>,
}

impl MemoryVideoStore {
    pub fn set_callback(&self, user_id: Uuid, url: &str) {
        self.inner.lock().unwrap().callbacks.insert(user_id, url.to_string());
    }

    pub fn video(&self, id: Uuid) -> VideoRecord {
        self.inner.lock().unwrap().videos[&id].clone()
    }

    pub fn faces(&self, id: Uuid) -> Vec<FaceRecord> {
        self.inner
            .lock()
            .unwrap()
            .faces
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Force a record into `status`, bypassing transition checks.
    pub fn force_status(&self, id: Uuid, status: VideoStatus) {
        if let Some(video) = self.inner.lock().unwrap().videos.get_mut(&id) {
            video.status = status;
        }
    }

    /// Clear the webhook flag, as if the terminal enqueue never happened.
    pub fn clear_webhook_flag(&self, id: Uuid) {
        if let Some(video) = self.inner.lock().unwrap().videos.get_mut(&id) {
            video.webhook_enqueued_at = None;
        }
    }
}

#[async_trait]
impl VideoStore for MemoryVideoStore {
    async fn get(&self, id: Uuid) -> Result<Option<VideoRecord>, StoreError> {
        Ok(self.inner.lock().unwrap().videos.get(&id).cloned())
    }

    async fn create(&self, video: NewVideo) -> Result<VideoRecord, StoreError> {
        let now = Utc::now();
        let record = VideoRecord {
            id: video.id,
            user_id: video.user_id,
            filename: video.filename,
            input_url: video.input_url,
            output_url: None,
            status: VideoStatus::Uploaded,
            upload_progress: video.upload_progress,
            processing_progress: 0,
            total_frames: 0,
            faces_detected: 0,
            frame_index: video.options.frame_index as i32,
            frame_screenshot_url: None,
            frame_screenshot_handle: None,
            redaction_intensity: video.options.intensity as i32,
            redaction_mode: video.options.mode,
            error_message: None,
            processing_duration_ms: None,
            active_job_id: video.active_job_id,
            webhook_enqueued_at: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        };
        self.inner
            .lock()
            .unwrap()
            .videos
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_fields(&self, id: Uuid, update: VideoUpdate) -> Result<VideoRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let video = inner.videos.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if let (Some(job_id), Some(active)) = (update.expected_job, video.active_job_id) {
            if job_id != active {
                return Err(StoreError::Superseded { id, job_id });
            }
        }
        if let Some(next) = update.status {
            if !video.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: video.status,
                    to: next,
                });
            }
            video.status = next;
        }
        if let Some(progress) = update.processing_progress {
            video.processing_progress = video.processing_progress.max(progress);
        }
        if let Some(frames) = update.total_frames {
            video.total_frames = frames;
        }
        if let Some(count) = update.faces_detected {
            video.faces_detected = count;
        }
        if let Some(url) = update.frame_screenshot_url {
            video.frame_screenshot_url = Some(url);
        }
        if let Some(handle) = update.frame_screenshot_handle {
            video.frame_screenshot_handle = Some(handle);
        }
        if let Some(intensity) = update.redaction_intensity {
            video.redaction_intensity = intensity;
        }
        if let Some(mode) = update.redaction_mode {
            video.redaction_mode = mode;
        }
        if let Some(message) = update.error_message {
            video.error_message = Some(message);
        }
        if let Some(ms) = update.processing_duration_ms {
            video.processing_duration_ms = Some(ms);
        }
        if let Some(at) = update.processed_at {
            video.processed_at = Some(at);
        }
        video.updated_at = Utc::now();
        Ok(video.clone())
    }

    async fn reset_for_reprocess(
        &self,
        id: Uuid,
        options: &ProcessingOptions,
        job_id: Uuid,
    ) -> Result<VideoRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let video = inner.videos.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !video.status.can_reset() {
            return Err(StoreError::ResetRefused {
                id,
                status: video.status,
            });
        }
        video.status = VideoStatus::Uploaded;
        video.processing_progress = 0;
        video.total_frames = 0;
        video.faces_detected = 0;
        video.frame_screenshot_url = None;
        video.frame_screenshot_handle = None;
        video.error_message = None;
        video.processed_at = None;
        video.processing_duration_ms = None;
        video.frame_index = options.frame_index as i32;
        video.redaction_intensity = options.intensity as i32;
        video.redaction_mode = options.mode;
        video.active_job_id = Some(job_id);
        video.webhook_enqueued_at = None;
        video.updated_at = Utc::now();
        Ok(video.clone())
    }

    async fn mark_webhook_enqueued(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let video = inner.videos.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        video.webhook_enqueued_at = Some(Utc::now());
        Ok(())
    }

    async fn replace_faces(&self, id: Uuid, faces: &[FaceRecord]) -> Result<(), StoreError> {
        self.inner.lock().unwrap().faces.insert(id, faces.to_vec());
        Ok(())
    }

    async fn delete_faces(&self, id: Uuid) -> Result<u64, StoreError> {
        let removed = self.inner.lock().unwrap().faces.remove(&id);
        Ok(removed.map(|f| f.len() as u64).unwrap_or(0))
    }

    async fn list_faces(&self, id: Uuid) -> Result<Vec<FaceRecord>, StoreError> {
        Ok(self.faces(id))
    }

    async fn callback_url(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(user_id) = inner.videos.get(&id).and_then(|v| v.user_id) else {
            return Ok(None);
        };
        Ok(inner.callbacks.get(&user_id).cloned())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Object storage

/// Storage double. Fetches return fake video bytes unless configured to fail.
#[derive(Default)]
pub struct MemoryStorage {
    fail_fetch: Mutex<Option<u16>>,
    fetches: AtomicUsize,
    publish_failures: AtomicUsize,
    published: Mutex<Vec<(PublishMetadata, usize)>>,
    deleted: Mutex<Vec<String>>,
}

impl MemoryStorage {
    /// Make every fetch answer with `status`.
    pub fn fail_fetch_with(&self, status: u16) {
        *self.fail_fetch.lock().unwrap() = Some(status);
    }

    /// Make the next `times` publishes answer 503.
    pub fn fail_publish_times(&self, times: usize) {
        self.publish_failures.store(times, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn published_keys(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(meta, _)| meta.key.clone())
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

pub fn public_url(key: &str) -> String {
    format!("https://media.test/{key}")
}

#[async_trait]
impl MediaStorage for MemoryStorage {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.fail_fetch.lock().unwrap() {
            return Err(StorageError::Status {
                status,
                key: locator.to_string(),
            });
        }
        Ok(b"\x00\x00\x00\x18ftypmp42 fake video".to_vec())
    }

    async fn publish(
        &self,
        bytes: Vec<u8>,
        metadata: &PublishMetadata,
    ) -> Result<PublishedObject, StorageError> {
        let failing = self
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Status {
                status: 503,
                key: metadata.key.clone(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((metadata.clone(), bytes.len()));
        Ok(PublishedObject {
            locator: public_url(&metadata.key),
            delete_handle: metadata.key.clone(),
        })
    }

    async fn delete(&self, delete_handle: &str) -> Result<(), StorageError> {
        self.deleted.lock().unwrap().push(delete_handle.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media toolkit

/// Probe reports a 10 s, 30 fps, 1280x720 clip. Extraction renders a flat
/// gray frame at the requested size.
#[derive(Default)]
pub struct FakeMedia {
    unreadable: Mutex<bool>,
    stall: Mutex<Option<Duration>>,
    extracted_at: Mutex<Vec<FrameTimestamp>>,
}

impl FakeMedia {
    /// Make media inspection stall for `delay` before answering.
    pub fn stall_for(&self, delay: Duration) {
        *self.stall.lock().unwrap() = Some(delay);
    }

    pub fn make_unreadable(&self) {
        *self.unreadable.lock().unwrap() = true;
    }

    pub fn extracted_at(&self) -> Vec<FrameTimestamp> {
        self.extracted_at.lock().unwrap().clone()
    }
}

pub const FAKE_INFO: VideoInfo = VideoInfo {
    duration_secs: 10.0,
    fps: 30.0,
    width: 1280,
    height: 720,
    total_frames: 300,
};

#[async_trait]
impl MediaToolkit for FakeMedia {
    async fn probe(&self, path: &Path) -> Result<VideoInfo, MediaError> {
        if !path.exists() {
            return Err(MediaError::InputMissing(path.display().to_string()));
        }
        if *self.unreadable.lock().unwrap() {
            return Err(MediaError::Malformed("no video stream".to_string()));
        }
        let delay = *self.stall.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(FAKE_INFO)
    }

    async fn extract_frame(
        &self,
        _input: &Path,
        output: &Path,
        at: FrameTimestamp,
        width: u32,
        height: u32,
    ) -> Result<(), MediaError> {
        self.extracted_at.lock().unwrap().push(at);
        let frame = RgbImage::from_fn(width, height, |x, _| Rgb([(x % 256) as u8, 128, 64]));
        let output: PathBuf = output.to_path_buf();
        frame
            .save(&output)
            .map_err(|e| MediaError::Io(std::io::Error::other(e.to_string())))
    }
}

// ---------------------------------------------------------------------------
// Face detector

/// Model that returns a fixed set of faces for every frame.
pub struct FixedFaces {
    faces: Mutex<Vec<RawFace>>,
    failure: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl FixedFaces {
    pub fn new(faces: Vec<RawFace>) -> Arc<Self> {
        Arc::new(Self {
            faces: Mutex::new(faces),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_faces(&self, faces: Vec<RawFace>) {
        *self.faces.lock().unwrap() = faces;
    }

    /// Make every detection fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceModel for FixedFaces {
    async fn detect(&self, _image: &image::DynamicImage) -> Result<Vec<RawFace>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(DetectorError::Model(message));
        }
        Ok(self.faces.lock().unwrap().clone())
    }
}

struct FixedLoader(Arc<FixedFaces>);

#[async_trait]
impl ModelLoader for FixedLoader {
    async fn load(&self) -> Result<Arc<dyn FaceModel>, DetectorError> {
        let model: Arc<dyn FaceModel> = self.0.clone();
        Ok(model)
    }
}

// ---------------------------------------------------------------------------
// Queues

/// Queue whose first `failures` enqueues are refused; everything else is
/// passed to the wrapped queue.
pub struct FlakyQueue {
    inner: Arc<MemoryQueue>,
    failures: AtomicUsize,
    refused: AtomicUsize,
}

impl FlakyQueue {
    pub fn new(inner: Arc<MemoryQueue>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicUsize::new(failures),
            refused: AtomicUsize::new(0),
        })
    }

    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    fn settings(&self) -> &QueueSettings {
        self.inner.settings()
    }

    async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(QueueError::Redis(redis::RedisError::from(std::io::Error::other(
                "connection reset by peer",
            ))));
        }
        self.inner.enqueue(payload, options).await
    }

    async fn try_dequeue(&self) -> Result<Option<Lease>, QueueError> {
        self.inner.try_dequeue().await
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        self.inner.ack(lease).await
    }

    async fn nack(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, QueueError> {
        self.inner.nack(lease, failure).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.inner.dead_letters(limit).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.inner.depth().await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.health_check().await
    }
}

// ---------------------------------------------------------------------------
// State

/// Handles on every double behind a test [`AppState`].
pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryVideoStore>,
    pub storage: Arc<MemoryStorage>,
    pub media: Arc<FakeMedia>,
    pub model: Arc<FixedFaces>,
    pub processing_queue: Arc<MemoryQueue>,
    pub webhook_queue: Arc<MemoryQueue>,
    _temp: tempfile::TempDir,
}

fn fast_settings(mut settings: QueueSettings) -> QueueSettings {
    settings.backoff = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5));
    settings.poll_interval = Duration::from_millis(5);
    settings
}

pub fn harness(faces: Vec<RawFace>) -> Harness {
    let store = Arc::new(MemoryVideoStore::default());
    let storage = Arc::new(MemoryStorage::default());
    let media = Arc::new(FakeMedia::default());
    let model = FixedFaces::new(faces);
    let processing_queue = Arc::new(MemoryQueue::new(fast_settings(QueueSettings::processing())));
    let webhook_queue = Arc::new(MemoryQueue::new(fast_settings(QueueSettings::webhook())));
    let temp = tempfile::tempdir().unwrap();

    let detector = FaceDetector::new(Arc::new(FixedLoader(model.clone())), 0.5);
    let webhooks = WebhookClient::new(WEBHOOK_SECRET, Duration::from_secs(5)).unwrap();

    let state = AppState {
        store: store.clone(),
        storage: storage.clone(),
        media: media.clone(),
        detector: Arc::new(detector),
        processing_queue: processing_queue.clone(),
        webhook_queue: webhook_queue.clone(),
        webhooks: Arc::new(webhooks),
        pipeline: PipelineSettings {
            temp_dir: temp.path().to_path_buf(),
            deadline: Duration::from_secs(30),
        },
    };

    Harness {
        state,
        store,
        storage,
        media,
        model,
        processing_queue,
        webhook_queue,
        _temp: temp,
    }
}

impl Harness {
    /// Files left behind in the workspace root.
    pub fn workspace_entries(&self) -> usize {
        std::fs::read_dir(&self.state.pipeline.temp_dir)
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

/// Run jobs from `queue` until nothing is ready, delayed or leased.
/// Returns every settlement in order.
pub async fn drain(state: &AppState, queue: &dyn JobQueue, role: WorkerRole) -> Vec<Settlement> {
    let mut settlements = Vec::new();
    for _ in 0..1000 {
        match worker::process_next_job(state, queue, role).await.unwrap() {
            Some(settlement) => settlements.push(settlement),
            None => {
                let depth = queue.depth().await.unwrap();
                if depth.ready + depth.delayed + depth.leased == 0 {
                    return settlements;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    }
    panic!("queue {} did not drain", queue.name());
}
