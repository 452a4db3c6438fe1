use async_trait::async_trait;
use reqwest::Client;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// What the caller knows about an object before publishing it.
#[derive(Debug, Clone)]
pub struct PublishMetadata {
    /// Object key inside the bucket, e.g. `screenshots/video_<id>_frame_1_blurred.jpg`.
    pub key: String,
    pub content_type: String,
}

impl PublishMetadata {
    pub fn jpeg(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            content_type: "image/jpeg".to_string(),
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedObject {
    /// Public locator handed to subscribers.
    pub locator: String,
    /// Internal handle for a later `delete`.
    pub delete_handle: String,
}

/// Durable media storage collaborator.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Retrieve the bytes behind a locator.
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError>;

    async fn publish(
        &self,
        bytes: Vec<u8>,
        metadata: &PublishMetadata,
    ) -> Result<PublishedObject, StorageError>;

    async fn delete(&self, delete_handle: &str) -> Result<(), StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
///
/// Locators starting with `http://` or `https://` are fetched over HTTP;
/// anything else is treated as a key in the bucket.
pub struct R2Client {
    bucket: Box<Bucket>,
    public_url: String,
    http: Client,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            public_url: public_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        })
    }

    fn public_locator(&self, key: &str) -> String {
        format!("{}/{}", self.public_url, key)
    }
}

fn is_http_locator(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

fn check_status(status: u16, key: &str) -> Result<(), StorageError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StorageError::Status {
            status,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl MediaStorage for R2Client {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        if is_http_locator(locator) {
            let response = self
                .http
                .get(locator)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(StorageError::Http)?;
            let bytes = response.bytes().await.map_err(StorageError::Http)?;
            return Ok(bytes.to_vec());
        }

        let response = self.bucket.get_object(locator).await.map_err(StorageError::S3)?;
        check_status(response.status_code(), locator)?;
        Ok(response.to_vec())
    }

    async fn publish(
        &self,
        bytes: Vec<u8>,
        metadata: &PublishMetadata,
    ) -> Result<PublishedObject, StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(&metadata.key, &bytes, &metadata.content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(response.status_code(), &metadata.key)?;

        tracing::debug!(key = %metadata.key, size = bytes.len(), "Object published");

        Ok(PublishedObject {
            locator: self.public_locator(&metadata.key),
            delete_handle: metadata.key.clone(),
        })
    }

    async fn delete(&self, delete_handle: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .delete_object(delete_handle)
            .await
            .map_err(StorageError::S3)?;
        check_status(response.status_code(), delete_handle)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("HTTP fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage returned status {status} for {key}")]
    Status { status: u16, key: String },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
