//! OpenAI-style HTTP provider client.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use super::{
    GeneratedMedia, GenerationClient, GenerationError, ImageRequest, VideoJob, VideoJobStatus,
    VideoRequest,
};

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<VideoErrorBody>,
}

#[derive(Debug, Deserialize)]
struct VideoErrorBody {
    #[serde(default)]
    message: String,
}

impl From<VideoResponse> for VideoJob {
    fn from(resp: VideoResponse) -> Self {
        Self {
            external_id: resp.id,
            status: VideoJobStatus::from_provider(&resp.status),
            error: resp
                .error
                .map(|e| e.message)
                .filter(|m| !m.trim().is_empty()),
        }
    }
}

/// Provider client speaking JSON over HTTP with bearer authentication.
pub struct HttpGenerationClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> crate::Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| crate::Error::Other(format!("Failed to build reqwest client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GenerationError> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(classify_transport)?;
        check_status(response).await
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, GenerationError> {
        let response = self.send(builder).await?;
        let body = response.bytes().await.map_err(classify_transport)?;
        serde_json::from_slice(&body).map_err(|e| GenerationError::InvalidResponse(e.to_string()))
    }
}

fn classify_transport(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Transport(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::GATEWAY_TIMEOUT {
        return Err(GenerationError::GatewayTimeout);
    }

    let body = response.text().await.unwrap_or_default();
    let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    Err(GenerationError::Upstream {
        status: status.as_u16(),
        message,
    })
}

fn decode_media(datum: ImageDatum) -> Result<GeneratedMedia, GenerationError> {
    let mime_type = datum.mime_type.unwrap_or_else(|| "image/png".to_string());
    let data = match datum.b64_json.filter(|b| !b.is_empty()) {
        Some(encoded) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| GenerationError::InvalidResponse(format!("bad base64: {}", e)))?,
        ),
        None => None,
    };
    Ok(GeneratedMedia {
        url: datum.url.filter(|u| !u.is_empty()),
        data,
        mime_type,
    })
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate_image(
        &self,
        request: &ImageRequest,
    ) -> Result<Vec<GeneratedMedia>, GenerationError> {
        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": request.count,
            "response_format": "b64_json",
        });
        if let Some(size) = &request.resolution {
            body["size"] = json!(size);
        }
        if let Some(aspect_ratio) = &request.aspect_ratio {
            body["aspect_ratio"] = json!(aspect_ratio);
        }
        if let Some(image) = &request.reference_image {
            body["image"] = json!(image);
        }

        let resp: ImageResponse = self
            .send_json(self.client.post(self.url("/v1/images/generations")).json(&body))
            .await?;

        let media = resp
            .data
            .into_iter()
            .map(decode_media)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>();

        if media.is_empty() {
            return Err(GenerationError::InvalidResponse(
                "provider returned no images".to_string(),
            ));
        }
        Ok(media)
    }

    async fn submit_video(&self, request: &VideoRequest) -> Result<VideoJob, GenerationError> {
        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
        });
        if let Some(seconds) = request.duration_secs {
            body["seconds"] = json!(seconds.to_string());
        }
        if let Some(size) = &request.resolution {
            body["size"] = json!(size);
        }
        if let Some(reference) = &request.reference_image {
            body["input_reference"] = json!(reference);
        }
        if let Some(seed) = request.seed {
            body["seed"] = json!(seed);
        }

        let resp: VideoResponse = self
            .send_json(self.client.post(self.url("/v1/videos")).json(&body))
            .await?;
        if resp.id.trim().is_empty() {
            return Err(GenerationError::InvalidResponse(
                "provider returned an empty video id".to_string(),
            ));
        }
        Ok(resp.into())
    }

    async fn poll_video(&self, external_id: &str) -> Result<VideoJob, GenerationError> {
        let resp: VideoResponse = self
            .send_json(
                self.client
                    .get(self.url(&format!("/v1/videos/{}", external_id))),
            )
            .await?;
        Ok(resp.into())
    }

    async fn fetch_video_content(
        &self,
        external_id: &str,
    ) -> Result<GeneratedMedia, GenerationError> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/v1/videos/{}/content", external_id))),
            )
            .await?;
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("video/mp4")
            .to_string();
        let bytes = response.bytes().await.map_err(classify_transport)?;
        if bytes.is_empty() {
            return Err(GenerationError::InvalidResponse(
                "provider returned empty video content".to_string(),
            ));
        }
        Ok(GeneratedMedia::from_bytes(bytes.to_vec(), mime_type))
    }
}
