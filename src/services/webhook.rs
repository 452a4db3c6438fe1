//! Signed completion/failure notifications.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::StoreError;
use crate::models::job::{DeliveryStatus, WebhookJob};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const EVENT_TYPE: &str = "video.processing.complete";

/// Body POSTed to the subscriber. Field order and names are part of the
/// wire format; absent values are sent as `null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub video_id: Uuid,
    pub status: DeliveryStatus,
    pub timestamp: String,
    pub output_url: Option<String>,
    pub processing_time: i64,
    pub error: Option<String>,
}

impl WebhookPayload {
    pub fn from_job(job: &WebhookJob, at: DateTime<Utc>) -> Self {
        Self {
            video_id: job.video_id,
            status: job.status,
            timestamp: format_timestamp(at),
            output_url: job.output_url.clone(),
            processing_time: job.processing_time_ms,
            error: job.error.clone(),
        }
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Hex-encoded HMAC-SHA256 of `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSecret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received signature.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    /// The owner has no callback URL; nothing to send.
    NoCallback,
}

impl DeliveryOutcome {
    pub fn label(self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::NoCallback => "no_callback",
        }
    }
}

/// HTTP sender with a fixed per-attempt timeout.
pub struct WebhookClient {
    http: Client,
    secret: String,
}

impl WebhookClient {
    pub fn new(secret: impl Into<String>, timeout: Duration) -> Result<Self, WebhookError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("face-redact-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(WebhookError::Http)?;
        Ok(Self {
            http,
            secret: secret.into(),
        })
    }

    /// Sign and POST `payload` to `url`. Any non-2xx answer is an error.
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<u16, WebhookError> {
        let body = serde_json::to_vec(payload).map_err(WebhookError::Serialize)?;
        let signature = sign(&self.secret, &body)?;

        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, EVENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(WebhookError::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(status.as_u16())
    }
}

/// Execute one webhook job: resolve the callback, then deliver.
pub async fn handle(state: &AppState, job: &WebhookJob) -> Result<DeliveryOutcome, WebhookError> {
    let Some(url) = state.store.callback_url(job.video_id).await? else {
        tracing::info!(video_id = %job.video_id, "No webhook URL configured, skipping delivery");
        return Ok(DeliveryOutcome::NoCallback);
    };

    let payload = WebhookPayload::from_job(job, Utc::now());
    let status = state.webhooks.deliver(&url, &payload).await?;

    tracing::info!(
        video_id = %job.video_id,
        status = %job.status,
        http_status = status,
        "Webhook delivered"
    );
    Ok(DeliveryOutcome::Delivered { status })
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Callback lookup failed: {0}")]
    Store(#[from] StoreError),

    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Subscriber responded with status {status}")]
    Rejected { status: u16 },

    #[error("Failed to serialize webhook payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Webhook secret cannot be used as an HMAC key")]
    InvalidSecret,
}

impl WebhookError {
    /// Network failures, non-2xx answers and store outages may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            WebhookError::Store(e) => e.is_transient(),
            WebhookError::Http(_) | WebhookError::Rejected { .. } => true,
            WebhookError::Serialize(_) | WebhookError::InvalidSecret => false,
        }
    }
}
