#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use gen_scheduler::config::{SettingsCache, StaticSettings};
use gen_scheduler::database::{DbPool, init_pool, run_migrations};
use gen_scheduler::generation::{
    GeneratedMedia, GenerationClient, GenerationError, ImageRequest, VideoJob, VideoJobStatus,
    VideoRequest,
};
use gen_scheduler::storage::LocalBlobStorage;

pub async fn setup_db() -> (TempDir, DbPool) {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("flow.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool(&db_url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub async fn settings(provider: StaticSettings) -> Arc<SettingsCache> {
    SettingsCache::load(Arc::new(provider)).await.unwrap()
}

pub fn storage(dir: &TempDir) -> Arc<LocalBlobStorage> {
    Arc::new(LocalBlobStorage::new(
        dir.path().join("blobs"),
        "https://media.test/",
    ))
}

/// One scripted provider response for an image call.
#[derive(Debug, Clone)]
pub enum ImageReply {
    Url(String),
    Bytes(Vec<u8>),
    Fail(GenerationError),
    Hang,
    Panic,
}

/// Scripted provider. Image calls pop replies in order and succeed with a
/// fixed URL once the script runs out. Video polls pop statuses the same way.
#[derive(Default)]
pub struct FakeClient {
    image_replies: Mutex<VecDeque<ImageReply>>,
    video_statuses: Mutex<VecDeque<VideoJobStatus>>,
    image_requests: Mutex<Vec<ImageRequest>>,
    submitted: Mutex<Vec<VideoRequest>>,
    polled: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_image(&self, reply: ImageReply) {
        self.image_replies.lock().push_back(reply);
    }

    pub fn push_video(&self, status: VideoJobStatus) {
        self.video_statuses.lock().push_back(status);
    }

    pub fn image_requests(&self) -> Vec<ImageRequest> {
        self.image_requests.lock().clone()
    }

    pub fn submitted(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn polled(&self) -> Vec<String> {
        self.polled.lock().clone()
    }

    fn next_video(&self) -> VideoJobStatus {
        self.video_statuses
            .lock()
            .pop_front()
            .unwrap_or(VideoJobStatus::InProgress)
    }
}

pub const DEFAULT_IMAGE_URL: &str = "https://provider.test/out.png";

#[async_trait]
impl GenerationClient for FakeClient {
    async fn generate_image(
        &self,
        request: &ImageRequest,
    ) -> Result<Vec<GeneratedMedia>, GenerationError> {
        self.image_requests.lock().push(request.clone());
        let reply = self.image_replies.lock().pop_front();
        match reply {
            None => Ok(vec![GeneratedMedia::from_url(DEFAULT_IMAGE_URL)]),
            Some(ImageReply::Url(url)) => Ok(vec![GeneratedMedia::from_url(url)]),
            Some(ImageReply::Bytes(data)) => Ok(vec![GeneratedMedia::from_bytes(data, "image/png")]),
            Some(ImageReply::Fail(e)) => Err(e),
            Some(ImageReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GenerationError::Transport("unreachable".to_string()))
            }
            Some(ImageReply::Panic) => panic!("provider client blew up"),
        }
    }

    async fn submit_video(&self, request: &VideoRequest) -> Result<VideoJob, GenerationError> {
        let mut submitted = self.submitted.lock();
        submitted.push(request.clone());
        Ok(VideoJob {
            external_id: format!("job-{}", submitted.len()),
            status: VideoJobStatus::Queued,
            error: None,
        })
    }

    async fn poll_video(&self, external_id: &str) -> Result<VideoJob, GenerationError> {
        self.polled.lock().push(external_id.to_string());
        let status = self.next_video();
        Ok(VideoJob {
            external_id: external_id.to_string(),
            status,
            error: (status == VideoJobStatus::Failed).then(|| "content policy".to_string()),
        })
    }

    async fn fetch_video_content(
        &self,
        external_id: &str,
    ) -> Result<GeneratedMedia, GenerationError> {
        Ok(GeneratedMedia {
            url: Some(format!("https://provider.test/{}.mp4", external_id)),
            data: None,
            mime_type: "video/mp4".to_string(),
        })
    }
}
