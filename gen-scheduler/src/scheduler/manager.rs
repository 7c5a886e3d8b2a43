//! Scheduler runtime: three independent queues plus their recovery loops.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::{QueueConfig, image_queue, page_queue, video_queue};
use super::image::ImageTaskHandler;
use super::page::PageTaskHandler;
use super::reaper::StaleTaskReaper;
use super::store::{GenerationStore, PageStore};
use super::video::VideoTaskHandler;
use super::worker_pool::WorkerPool;
use crate::Result;
use crate::config::{AppConfig, DEFAULT_REFRESH_INTERVAL, SettingsCache};
use crate::database::models::TaskKind;
use crate::database::repositories::{CompositeRepository, TaskRepository};
use crate::generation::GenerationClient;
use crate::storage::BlobStorage;

/// Configuration of all queues. Omitted sections and fields keep the
/// defaults of their kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(deserialize_with = "image_queue")]
    pub image: QueueConfig,
    #[serde(deserialize_with = "video_queue")]
    pub video: QueueConfig,
    #[serde(deserialize_with = "page_queue")]
    pub page: QueueConfig,
    /// Interval between settings refreshes, in seconds.
    pub settings_refresh_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            image: QueueConfig::for_kind(TaskKind::Image),
            video: QueueConfig::for_kind(TaskKind::Video),
            page: QueueConfig::for_kind(TaskKind::Page),
            settings_refresh_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_app(app: &AppConfig) -> Self {
        let mut config = Self::default();
        if app.page_high_concurrency {
            config.page = config.page.with_workers(2);
        }
        config
    }

    pub fn settings_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.settings_refresh_secs.max(1))
    }
}

/// Shared collaborators of the queues.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub tasks: Arc<dyn TaskRepository>,
    pub composites: Arc<dyn CompositeRepository>,
    pub client: Arc<dyn GenerationClient>,
    pub storage: Arc<dyn BlobStorage>,
    pub settings: Arc<SettingsCache>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    settings: Arc<SettingsCache>,

    image_handler: Arc<ImageTaskHandler>,
    video_handler: Arc<VideoTaskHandler>,
    page_handler: Arc<PageTaskHandler>,

    image_pool: WorkerPool,
    video_pool: WorkerPool,
    page_pool: WorkerPool,

    image_reaper: Arc<StaleTaskReaper<GenerationStore>>,
    video_reaper: Arc<StaleTaskReaper<GenerationStore>>,
    page_reaper: Arc<StaleTaskReaper<PageStore>>,

    cancellation_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig) -> Self {
        let image_store = GenerationStore::new(deps.tasks.clone(), TaskKind::Image);
        let video_store = GenerationStore::new(deps.tasks.clone(), TaskKind::Video);
        let page_store = PageStore::new(deps.composites.clone());

        let image_handler = Arc::new(ImageTaskHandler::new(
            image_store.clone(),
            deps.client.clone(),
            deps.storage.clone(),
            deps.settings.clone(),
            config.image.retry_ladder(),
        ));
        let video_handler = Arc::new(VideoTaskHandler::new(
            video_store.clone(),
            deps.client.clone(),
            deps.storage.clone(),
            deps.settings.clone(),
            config.video.retry_ladder(),
            config.video.poll_delay(),
        ));
        let page_handler = Arc::new(PageTaskHandler::new(
            page_store.clone(),
            deps.client.clone(),
            deps.storage.clone(),
            deps.settings.clone(),
            config.page.retry_ladder(),
        ));

        let pool = |kind: TaskKind, queue: &QueueConfig| {
            WorkerPool::new(kind, queue.workers, queue.poll_interval())
        };
        let reaper = |queue: &QueueConfig| (queue.stale_after(), queue.stale_check_interval());

        let (image_after, image_every) = reaper(&config.image);
        let (video_after, video_every) = reaper(&config.video);
        let (page_after, page_every) = reaper(&config.page);

        Self {
            image_pool: pool(TaskKind::Image, &config.image),
            video_pool: pool(TaskKind::Video, &config.video),
            page_pool: pool(TaskKind::Page, &config.page),
            image_reaper: Arc::new(StaleTaskReaper::new(
                Arc::new(image_store),
                image_after,
                image_every,
            )
            .with_settings(deps.settings.clone())),
            video_reaper: Arc::new(StaleTaskReaper::new(
                Arc::new(video_store),
                video_after,
                video_every,
            )
            .with_settings(deps.settings.clone())),
            page_reaper: Arc::new(StaleTaskReaper::new(
                Arc::new(page_store),
                page_after,
                page_every,
            )
            .with_settings(deps.settings.clone())),
            image_handler,
            video_handler,
            page_handler,
            settings: deps.settings,
            config,
            cancellation_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Recover orphaned rows, then start workers, reapers and the settings
    /// refresh loop.
    ///
    /// Startup recovery completes before any worker polls, so a row left
    /// RUNNING by a previous process is never mistaken for live work.
    pub async fn start(&self) -> Result<()> {
        info!("Starting scheduler");

        self.image_reaper.recover_on_startup().await?;
        self.video_reaper.recover_on_startup().await?;
        self.page_reaper.recover_on_startup().await?;

        self.image_pool.start(self.image_handler.clone());
        self.video_pool.start(self.video_handler.clone());
        self.page_pool.start(self.page_handler.clone());

        let token = &self.cancellation_token;
        let mut background = self.background.lock();
        background.push(self.image_reaper.clone().start(token.clone()));
        background.push(self.video_reaper.clone().start(token.clone()));
        background.push(self.page_reaper.clone().start(token.clone()));
        background.push(
            self.settings
                .spawn_refresh(self.config.settings_refresh_interval(), token.clone()),
        );

        info!(
            image_workers = self.config.image.workers,
            video_workers = self.config.video.workers,
            page_workers = self.config.page.workers,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop polling, let in-flight tasks finish, and stop background loops.
    pub async fn stop(&self) {
        info!("Stopping scheduler");
        self.cancellation_token.cancel();

        self.image_pool.stop().await;
        self.video_pool.stop().await;
        self.page_pool.stop().await;

        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        futures::future::join_all(handles).await;

        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}
