//! Image task execution.

use async_trait::async_trait;
use std::sync::Arc;

use super::config::RetryLadder;
use super::outcome::{Outcome, RETRY_LIMIT_MESSAGE, record_failure, record_success, record_terminal};
use super::store::GenerationStore;
use super::worker_pool::TaskHandler;
use crate::config::SettingsCache;
use crate::database::models::{GenerationTaskDbModel, TaskKind};
use crate::generation::{GenerationClient, GenerationError, ImageRequest};
use crate::storage::{BlobStorage, resolve_media};
use crate::{Error, Result};

pub struct ImageTaskHandler {
    store: GenerationStore,
    client: Arc<dyn GenerationClient>,
    storage: Arc<dyn BlobStorage>,
    settings: Arc<SettingsCache>,
    ladder: RetryLadder,
}

impl ImageTaskHandler {
    pub fn new(
        store: GenerationStore,
        client: Arc<dyn GenerationClient>,
        storage: Arc<dyn BlobStorage>,
        settings: Arc<SettingsCache>,
        ladder: RetryLadder,
    ) -> Self {
        Self {
            store,
            client,
            storage,
            settings,
            ladder,
        }
    }

    async fn generate(&self, task: &GenerationTaskDbModel) -> Result<Vec<String>> {
        let params = task.params()?.normalized();
        let request = ImageRequest {
            model: task.model_id.clone(),
            prompt: task.prompt.clone(),
            count: params.count,
            resolution: params.resolution,
            aspect_ratio: params.aspect_ratio,
            reference_image: params.reference_image,
        };

        let media = self.client.generate_image(&request).await?;
        let mut urls = Vec::with_capacity(media.len());
        for item in &media {
            urls.push(resolve_media(self.storage.as_ref(), item).await?);
        }
        if urls.is_empty() {
            return Err(GenerationError::InvalidResponse("provider returned no images".into()).into());
        }
        Ok(urls)
    }
}

#[async_trait]
impl TaskHandler for ImageTaskHandler {
    type Store = GenerationStore;

    fn store(&self) -> &GenerationStore {
        &self.store
    }

    async fn process(&self, task: GenerationTaskDbModel) -> Outcome {
        let claim = task.claim();
        let max_attempts = self.settings.max_attempts(TaskKind::Image);
        if task.attempts > max_attempts {
            return record_terminal(&self.store, &claim, RETRY_LIMIT_MESSAGE).await;
        }

        let timeout = self.settings.task_timeout(TaskKind::Image);
        let result = tokio::time::timeout(timeout, self.generate(&task))
            .await
            .unwrap_or_else(|_| Err(Error::Generation(GenerationError::Timeout)));

        match result {
            Ok(urls) => record_success(&self.store, &claim, &urls).await,
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
