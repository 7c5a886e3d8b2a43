//! Queue adapters over the repositories.
//!
//! Workers, the reaper and the outcome helpers only talk to [`TaskStore`], so
//! image, video and page queues share one lifecycle implementation.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::database::models::{Claim, GenerationTaskDbModel, PageTaskDbModel, TaskKind};
use crate::database::repositories::{CompositeRepository, TaskRepository};
use crate::database::time::{ms_after, now_ms};

/// A claimed row as seen by the lifecycle.
pub trait ClaimedTask: Send + Sync + 'static {
    fn id(&self) -> &str;
    /// Fencing token for post-claim writes.
    fn claim(&self) -> Claim;
    /// Claims that count toward the retry ceiling and backoff ladder.
    fn round_attempts(&self) -> i64;
}

impl ClaimedTask for GenerationTaskDbModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn claim(&self) -> Claim {
        GenerationTaskDbModel::claim(self)
    }

    fn round_attempts(&self) -> i64 {
        self.attempts
    }
}

impl ClaimedTask for PageTaskDbModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn claim(&self) -> Claim {
        PageTaskDbModel::claim(self)
    }

    fn round_attempts(&self) -> i64 {
        self.attempts_in_round()
    }
}

/// Durable queue of one task kind.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    type Task: ClaimedTask;

    fn kind(&self) -> TaskKind;

    /// Atomically claim the next due row, if any.
    async fn claim_next(&self) -> Result<Option<Self::Task>>;

    async fn complete(&self, claim: &Claim, media: &[String]) -> Result<bool>;

    async fn fail_terminal(&self, claim: &Claim, message: &str) -> Result<bool>;

    async fn schedule_retry(&self, claim: &Claim, delay: Duration, message: &str)
    -> Result<bool>;

    /// Requeue rows left running since before `cutoff_ms`.
    async fn reset_stale_running(&self, cutoff_ms: i64) -> Result<u64>;
}

/// Image or video queue backed by `generation_task`.
#[derive(Clone)]
pub struct GenerationStore {
    repo: Arc<dyn TaskRepository>,
    kind: TaskKind,
}

impl GenerationStore {
    pub fn new(repo: Arc<dyn TaskRepository>, kind: TaskKind) -> Self {
        Self { repo, kind }
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    /// Keep a submitted provider job running and come back after `delay`.
    pub async fn park(&self, claim: &Claim, external_id: &str, delay: Duration) -> Result<bool> {
        self.repo
            .park(claim, external_id, ms_after(now_ms(), delay))
            .await
    }
}

#[async_trait]
impl TaskStore for GenerationStore {
    type Task = GenerationTaskDbModel;

    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn claim_next(&self) -> Result<Option<GenerationTaskDbModel>> {
        self.repo.claim_next(self.kind, now_ms()).await
    }

    async fn complete(&self, claim: &Claim, media: &[String]) -> Result<bool> {
        self.repo.complete(claim, media).await
    }

    async fn fail_terminal(&self, claim: &Claim, message: &str) -> Result<bool> {
        self.repo.fail(claim, message).await
    }

    async fn schedule_retry(
        &self,
        claim: &Claim,
        delay: Duration,
        message: &str,
    ) -> Result<bool> {
        self.repo
            .schedule_retry(claim, ms_after(now_ms(), delay), message)
            .await
    }

    async fn reset_stale_running(&self, cutoff_ms: i64) -> Result<u64> {
        self.repo.reset_stale_running(self.kind, cutoff_ms).await
    }
}

/// Page queue backed by `page_task`.
#[derive(Clone)]
pub struct PageStore {
    repo: Arc<dyn CompositeRepository>,
}

impl PageStore {
    pub fn new(repo: Arc<dyn CompositeRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn CompositeRepository> {
        &self.repo
    }
}

#[async_trait]
impl TaskStore for PageStore {
    type Task = PageTaskDbModel;

    fn kind(&self) -> TaskKind {
        TaskKind::Page
    }

    async fn claim_next(&self) -> Result<Option<PageTaskDbModel>> {
        self.repo.claim_next_page(now_ms()).await
    }

    async fn complete(&self, claim: &Claim, media: &[String]) -> Result<bool> {
        let Some(url) = media.first() else {
            return self.repo.fail_page(claim, "no media produced").await;
        };
        self.repo.complete_page(claim, url).await
    }

    async fn fail_terminal(&self, claim: &Claim, message: &str) -> Result<bool> {
        self.repo.fail_page(claim, message).await
    }

    async fn schedule_retry(
        &self,
        claim: &Claim,
        delay: Duration,
        message: &str,
    ) -> Result<bool> {
        self.repo
            .schedule_page_retry(claim, ms_after(now_ms(), delay), message)
            .await
    }

    async fn reset_stale_running(&self, cutoff_ms: i64) -> Result<u64> {
        self.repo.reset_stale_running(cutoff_ms).await
    }
}
