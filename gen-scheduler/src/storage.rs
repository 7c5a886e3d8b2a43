//! Blob storage for generated media.

use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::warn;

use crate::generation::GeneratedMedia;
use crate::{Error, Result};

/// Persists raw media and returns a stable URL.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn put(&self, data: &[u8], content_type: &str) -> Result<String>;
}

/// Content-addressed files under a local directory.
pub struct LocalBlobStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        _ => "bin",
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn put(&self, data: &[u8], content_type: &str) -> Result<String> {
        if data.is_empty() {
            return Err(Error::validation("refusing to store empty media"));
        }
        let digest = hex::encode(Sha256::digest(data));
        let file_name = format!("{}.{}", digest, extension_for(content_type));

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(&file_name);
        if tokio::fs::try_exists(&path).await? {
            return Ok(format!("{}/{}", self.public_base_url, file_name));
        }

        // Write then rename so readers never see a partial file. Each writer
        // gets its own temp file; concurrent writers of the same content race
        // only on the rename.
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            if !tokio::fs::try_exists(&path).await? {
                return Err(e.into());
            }
        }

        Ok(format!("{}/{}", self.public_base_url, file_name))
    }
}

fn data_uri(data: &[u8], mime_type: &str) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

/// Turn provider output into a URL to persist with the task.
///
/// Inline bytes are stored. If storing fails, the provider's own URL is used
/// when there is one, otherwise the bytes are embedded as a `data:` URI.
pub async fn resolve_media(storage: &dyn BlobStorage, media: &GeneratedMedia) -> Result<String> {
    match (&media.data, &media.url) {
        (Some(data), url) if !data.is_empty() => match storage.put(data, &media.mime_type).await {
            Ok(stored) => Ok(stored),
            Err(e) => match url.as_deref().filter(|u| !u.is_empty()) {
                Some(direct) => {
                    warn!(error = %e, "Failed to store media, using provider URL");
                    Ok(direct.to_string())
                }
                None => {
                    warn!(error = %e, "Failed to store media, embedding inline");
                    Ok(data_uri(data, &media.mime_type))
                }
            },
        },
        (_, Some(url)) if !url.is_empty() => Ok(url.clone()),
        _ => Err(Error::validation("provider returned empty media")),
    }
}
