//! Page task execution for composite records.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::aggregate::refresh_record_status;
use super::config::RetryLadder;
use super::outcome::{Outcome, RETRY_LIMIT_MESSAGE, record_failure, record_success, record_terminal};
use super::store::PageStore;
use super::worker_pool::TaskHandler;
use crate::config::SettingsCache;
use crate::database::models::{Claim, CompositeRecordDbModel, PageTaskDbModel, TaskKind};
use crate::generation::{GenerationClient, GenerationError, ImageRequest};
use crate::storage::{BlobStorage, resolve_media};
use crate::{Error, Result};

/// Prompt used for every page unless overridden.
///
/// Placeholders: `{topic}`, `{outline}`, `{page_content}`, `{page_type}`,
/// `{page_index}`.
pub const DEFAULT_PAGE_PROMPT: &str = "Illustrate page {page_index} ({page_type}) of a picture \
story about \"{topic}\".\n\nStory outline:\n{outline}\n\nThis page:\n{page_content}";

/// Fill the page prompt template.
pub fn render_page_prompt(
    template: &str,
    record: &CompositeRecordDbModel,
    page: &PageTaskDbModel,
) -> String {
    template
        .replace("{topic}", record.topic.trim())
        .replace("{outline}", record.outline.trim())
        .replace("{page_content}", page.content.trim())
        .replace("{page_type}", &page.page_type.to_ascii_lowercase())
        .replace("{page_index}", &page.page_index.to_string())
}

/// Reference image for a page: the cover draws on the user's first upload,
/// every other page on the generated cover.
fn reference_for(record: &CompositeRecordDbModel, page: &PageTaskDbModel) -> Option<String> {
    if page.is_cover() {
        record.reference_images().into_iter().next()
    } else {
        record
            .cover_url
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| record.reference_images().into_iter().next())
    }
}

pub struct PageTaskHandler {
    store: PageStore,
    client: Arc<dyn GenerationClient>,
    storage: Arc<dyn BlobStorage>,
    settings: Arc<SettingsCache>,
    ladder: RetryLadder,
    prompt_template: String,
}

impl PageTaskHandler {
    pub fn new(
        store: PageStore,
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
            prompt_template: DEFAULT_PAGE_PROMPT.to_string(),
        }
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    async fn generate(&self, page: &PageTaskDbModel) -> Result<String> {
        let record = self.store.repository().get_record(&page.record_id).await?;
        let request = ImageRequest {
            model: record.model_id.clone(),
            prompt: render_page_prompt(&self.prompt_template, &record, page),
            count: 1,
            resolution: None,
            aspect_ratio: None,
            reference_image: reference_for(&record, page),
        };

        let media = self.client.generate_image(&request).await?;
        let first = media.into_iter().next().ok_or_else(|| {
            Error::Generation(GenerationError::InvalidResponse(
                "provider returned no images".to_string(),
            ))
        })?;
        resolve_media(self.storage.as_ref(), &first).await
    }

    async fn refresh_if_terminal(&self, record_id: &str, outcome: Outcome) -> Outcome {
        if outcome.is_terminal()
            && let Err(e) = refresh_record_status(self.store.repository().as_ref(), record_id).await
        {
            warn!(record_id, error = %e, "Failed to refresh record status");
        }
        outcome
    }
}

#[async_trait]
impl TaskHandler for PageTaskHandler {
    type Store = PageStore;

    fn store(&self) -> &PageStore {
        &self.store
    }

    async fn process(&self, page: PageTaskDbModel) -> Outcome {
        let claim = page.claim();
        let attempts = page.attempts_in_round();
        let max_attempts = self.settings.max_attempts(TaskKind::Page);
        if attempts > max_attempts {
            let outcome = record_terminal(&self.store, &claim, RETRY_LIMIT_MESSAGE).await;
            return self.refresh_if_terminal(&page.record_id, outcome).await;
        }

        let timeout = self.settings.task_timeout(TaskKind::Page);
        let result = tokio::time::timeout(timeout, self.generate(&page))
            .await
            .unwrap_or_else(|_| Err(Error::Generation(GenerationError::Timeout)));

        let outcome = match result {
            Ok(url) => record_success(&self.store, &claim, &[url]).await,
            Err(e) => {
                record_failure(
                    &self.store,
                    &claim,
                    attempts,
                    max_attempts,
                    &self.ladder,
                    &e,
                )
                .await
            }
        };
        self.refresh_if_terminal(&page.record_id, outcome).await
    }

    async fn recover(&self, claim: &Claim, message: &str) -> Outcome {
        let outcome = record_terminal(&self.store, claim, message).await;
        if !outcome.is_terminal() {
            return outcome;
        }
        match self.store.repository().get_page(&claim.id).await {
            Ok(page) => self.refresh_if_terminal(&page.record_id, outcome).await,
            Err(e) => {
                warn!(page_id = %claim.id, error = %e, "Failed to load page after recovery");
                outcome
            }
        }
    }
}
