//! Outbound generation provider.
//!
//! The scheduler only sees [`GenerationClient`] and the classification in
//! [`GenerationError`]; provider payloads never leave this module.

mod http;

pub use http::{HttpGenerationClient, install_rustls_provider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a generation provider, pre-classified for retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The call did not finish within its deadline.
    #[error("generation timed out")]
    Timeout,

    /// The provider's gateway gave up (HTTP 504).
    #[error("upstream gateway timeout")]
    GatewayTimeout,

    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The provider accepted the job but reported it as failed.
    #[error("generation failed: {0}")]
    Rejected(String),
}

impl GenerationError {
    /// Only deadline-class errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::GatewayTimeout)
    }
}

/// A produced media item: a direct URL, inline bytes, or both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GeneratedMedia {
    pub url: Option<String>,
    pub data: Option<Vec<u8>>,
    pub mime_type: String,
}

impl GeneratedMedia {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            data: None,
            mime_type: "image/png".to_string(),
        }
    }

    pub fn from_bytes(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            url: None,
            data: Some(data),
            mime_type: mime_type.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.url.as_deref().is_none_or(str::is_empty)
            && self.data.as_ref().is_none_or(Vec::is_empty)
    }
}

/// Image generation input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub count: u32,
    pub resolution: Option<String>,
    pub aspect_ratio: Option<String>,
    pub reference_image: Option<String>,
}

/// Video generation input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub model: String,
    pub prompt: String,
    pub duration_secs: Option<u32>,
    pub resolution: Option<String>,
    pub reference_image: Option<String>,
    pub seed: Option<i64>,
}

/// Provider-side state of an asynchronous video job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoJobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl VideoJobStatus {
    /// Map a provider status string; unknown values count as in progress.
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "submitted" => Self::Queued,
            "completed" | "succeeded" | "success" => Self::Completed,
            "failed" | "error" | "cancelled" | "canceled" => Self::Failed,
            _ => Self::InProgress,
        }
    }
}

/// Handle on a submitted video job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoJob {
    pub external_id: String,
    pub status: VideoJobStatus,
    pub error: Option<String>,
}

/// The external provider.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate_image(
        &self,
        request: &ImageRequest,
    ) -> Result<Vec<GeneratedMedia>, GenerationError>;

    async fn submit_video(&self, request: &VideoRequest) -> Result<VideoJob, GenerationError>;

    async fn poll_video(&self, external_id: &str) -> Result<VideoJob, GenerationError>;

    async fn fetch_video_content(&self, external_id: &str)
    -> Result<GeneratedMedia, GenerationError>;
}
