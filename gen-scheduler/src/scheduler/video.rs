//! Video task execution.
//!
//! Video generation is asynchronous on the provider side. The first claim
//! submits the job and parks the row (still RUNNING, with the provider job id
//! and a poll time). Each later claim polls once; a finished job's content is
//! downloaded and stored, a rejected job fails the task, anything else parks
//! again. Every claim, including polls, counts as an attempt.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::config::RetryLadder;
use super::outcome::{
    Outcome, RETRY_LIMIT_MESSAGE, record_failure, record_success, record_terminal,
};
use super::store::GenerationStore;
use super::worker_pool::TaskHandler;
use crate::config::SettingsCache;
use crate::database::models::{GenerationTaskDbModel, TaskKind};
use crate::generation::{GenerationClient, GenerationError, VideoJobStatus, VideoRequest};
use crate::storage::{BlobStorage, resolve_media};
use crate::{Error, Result};

/// Result of one claim's worth of provider interaction.
#[derive(Debug)]
enum VideoStep {
    Pending { external_id: String },
    Ready { url: String },
    Rejected { message: String },
}

pub struct VideoTaskHandler {
    store: GenerationStore,
    client: Arc<dyn GenerationClient>,
    storage: Arc<dyn BlobStorage>,
    settings: Arc<SettingsCache>,
    ladder: RetryLadder,
    poll_delay: Duration,
}

impl VideoTaskHandler {
    pub fn new(
        store: GenerationStore,
        client: Arc<dyn GenerationClient>,
        storage: Arc<dyn BlobStorage>,
        settings: Arc<SettingsCache>,
        ladder: RetryLadder,
        poll_delay: Duration,
    ) -> Self {
        Self {
            store,
            client,
            storage,
            settings,
            ladder,
            poll_delay,
        }
    }

    async fn advance(&self, task: &GenerationTaskDbModel) -> Result<VideoStep> {
        let job = match task.external_id.as_deref().filter(|id| !id.is_empty()) {
            Some(external_id) => self.client.poll_video(external_id).await?,
            None => {
                let params = task.params()?;
                let request = VideoRequest {
                    model: task.model_id.clone(),
                    prompt: task.prompt.clone(),
                    duration_secs: params.duration_secs,
                    resolution: params.resolution,
                    reference_image: params.reference_image,
                    seed: params.seed,
                };
                self.client.submit_video(&request).await?
            }
        };

        match job.status {
            VideoJobStatus::Completed => {
                let media = self.client.fetch_video_content(&job.external_id).await?;
                let url = resolve_media(self.storage.as_ref(), &media).await?;
                Ok(VideoStep::Ready { url })
            }
            VideoJobStatus::Failed => Ok(VideoStep::Rejected {
                message: job
                    .error
                    .unwrap_or_else(|| "video generation failed".to_string()),
            }),
            VideoJobStatus::Queued | VideoJobStatus::InProgress => Ok(VideoStep::Pending {
                external_id: job.external_id,
            }),
        }
    }
}

#[async_trait]
impl TaskHandler for VideoTaskHandler {
    type Store = GenerationStore;

    fn store(&self) -> &GenerationStore {
        &self.store
    }

    async fn process(&self, task: GenerationTaskDbModel) -> Outcome {
        let claim = task.claim();
        let max_attempts = self.settings.max_attempts(TaskKind::Video);
        if task.attempts > max_attempts {
            return record_terminal(&self.store, &claim, RETRY_LIMIT_MESSAGE).await;
        }

        let timeout = self.settings.task_timeout(TaskKind::Video);
        let result = tokio::time::timeout(timeout, self.advance(&task))
            .await
            .unwrap_or_else(|_| Err(Error::Generation(GenerationError::Timeout)));

        match result {
            Ok(VideoStep::Ready { url }) => record_success(&self.store, &claim, &[url]).await,
            Ok(VideoStep::Rejected { message }) => {
                record_terminal(&self.store, &claim, &message).await
            }
            Ok(VideoStep::Pending { external_id }) => {
                match self.store.park(&claim, &external_id, self.poll_delay).await {
                    Ok(true) => {
                        debug!(
                            task_id = %claim.id,
                            external_id = %external_id,
                            attempts = task.attempts,
                            "Video job pending, parked until next poll"
                        );
                        Outcome::Retrying {
                            delay: self.poll_delay,
                        }
                    }
                    Ok(false) => Outcome::Superseded,
                    Err(e) => {
                        error!(task_id = %claim.id, error = %e, "Failed to park video task");
                        Outcome::Unrecorded
                    }
                }
            }
            Err(e) => {
                record_failure(
                    &self.store,
                    &claim,
                    task.attempts,
                    max_attempts,
                    &self.ladder,
                    &e,
                )
                .await
            }
        }
    }
}
