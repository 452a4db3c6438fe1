//! Face detection capability.
//!
//! The model itself is a black box behind [`FaceModel`]. [`FaceDetector`]
//! loads it lazily on first use, shares it across every worker in the
//! process and applies the confidence threshold.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::models::face::{BoundingBox, DetectedFace, FaceLandmarks};

/// A face as reported by the model, before filtering and numbering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawFace {
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub landmarks: FaceLandmarks,
    pub confidence: f32,
}

impl RawFace {
    fn is_well_formed(&self) -> bool {
        let b = &self.bounding_box;
        [b.x, b.y, b.width, b.height, self.confidence]
            .iter()
            .all(|v| v.is_finite())
            && b.width > 0.0
            && b.height > 0.0
    }
}

/// A loaded detection model.
#[async_trait]
pub trait FaceModel: Send + Sync {
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<RawFace>, DetectorError>;
}

/// Performs the one-time model load.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn FaceModel>, DetectorError>;
}

/// Process-wide face detector.
///
/// Concurrent first callers wait on a single load. A failed load is not
/// cached, so the next call tries again.
pub struct FaceDetector {
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<dyn FaceModel>>,
    min_confidence: f32,
}

impl FaceDetector {
    pub fn new(loader: Arc<dyn ModelLoader>, min_confidence: f32) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
            min_confidence,
        }
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> Result<&Arc<dyn FaceModel>, DetectorError> {
        self.model
            .get_or_try_init(|| async {
                tracing::info!("Loading face detection model");
                let model = self.loader.load().await?;
                tracing::info!("Face detection model ready");
                Ok::<_, DetectorError>(model)
            })
            .await
    }

    /// Detect faces at or above the confidence threshold, numbered from 1
    /// in model output order.
    pub async fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let model = self.model().await?;
        let raw = model.detect(image).await?;

        let faces = raw
            .into_iter()
            .filter(|f| f.is_well_formed() && f.confidence >= self.min_confidence)
            .enumerate()
            .map(|(i, f)| DetectedFace {
                index: i as u32 + 1,
                bounding_box: f.bounding_box,
                landmarks: f.landmarks,
                confidence: f.confidence,
            })
            .collect();
        Ok(faces)
    }
}

/// Client for a face-detection inference service.
pub struct RemoteModelLoader {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct ModelInfo {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct DetectResponse {
    faces: Vec<RawFace>,
}

impl RemoteModelLoader {
    pub fn new(
        endpoint: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DetectorError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DetectorError::Http)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

fn with_token(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

#[async_trait]
impl ModelLoader for RemoteModelLoader {
    async fn load(&self) -> Result<Arc<dyn FaceModel>, DetectorError> {
        let url = format!("{}/v1/models/face", self.endpoint);
        let info: ModelInfo = with_token(self.http.get(&url), self.api_token.as_deref())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
            .json()
            .await
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;

        tracing::info!(
            model = %info.name,
            version = info.version.as_deref().unwrap_or("unknown"),
            "Remote face model available"
        );

        Ok(Arc::new(RemoteFaceModel {
            http: self.http.clone(),
            detect_url: format!("{}/v1/detect", self.endpoint),
            api_token: self.api_token.clone(),
        }))
    }
}

struct RemoteFaceModel {
    http: Client,
    detect_url: String,
    api_token: Option<String>,
}

#[async_trait]
impl FaceModel for RemoteFaceModel {
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<RawFace>, DetectorError> {
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .map_err(DetectorError::Encode)?;

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(png.into_inner()),
            "landmarks": true,
        });

        let response: DetectResponse =
            with_token(self.http.post(&self.detect_url), self.api_token.as_deref())
                .json(&request_body)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(DetectorError::Http)?
                .json()
                .await
                .map_err(DetectorError::Http)?;

        Ok(response.faces)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Face model failed to load: {0}")]
    ModelLoad(String),

    #[error("Detection request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to encode frame for detection: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Detection failed: {0}")]
    Model(String),
}
