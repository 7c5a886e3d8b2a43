//! Composite record operations.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::admission::{AdmissionController, KeepAlive, WaitContext};
use crate::database::models::{
    CompositeRecordDbModel, PageDraft, PageStatusCounts, PageTaskDbModel, PageType,
};
use crate::database::repositories::CompositeRepository;
use crate::{Error, Result};

/// A caller's record draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub user_id: i64,
    pub topic: String,
    #[serde(default)]
    pub outline: String,
    pub model_id: String,
    #[serde(default)]
    pub reference_images: Vec<String>,
    pub pages: Vec<PageDraft>,
}

/// A record with its pages and their tally.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub record: CompositeRecordDbModel,
    pub pages: Vec<PageTaskDbModel>,
    pub counts: PageStatusCounts,
}

/// Exactly one cover, and it comes first.
///
/// The first page becomes the cover; any later page marked as a cover is
/// demoted to content. Page order (and so the dense index) is kept.
pub fn normalize_pages(pages: Vec<PageDraft>) -> Vec<PageDraft> {
    pages
        .into_iter()
        .enumerate()
        .map(|(i, mut page)| {
            page.page_type = match (i, page.page_type) {
                (0, _) => PageType::Cover,
                (_, PageType::Cover) => PageType::Content,
                (_, other) => other,
            };
            page
        })
        .collect()
}

pub struct CompositeService {
    repo: Arc<dyn CompositeRepository>,
    admission: Arc<AdmissionController>,
}

impl CompositeService {
    pub fn new(repo: Arc<dyn CompositeRepository>, admission: Arc<AdmissionController>) -> Self {
        Self { repo, admission }
    }

    /// Store a draft record and its pages. Nothing is scheduled until
    /// [`start_generation`](Self::start_generation).
    pub async fn create_record(&self, request: NewRecord) -> Result<CompositeRecordDbModel> {
        if request.user_id <= 0 {
            return Err(Error::validation("invalid user id"));
        }
        if request.model_id.trim().is_empty() {
            return Err(Error::validation("model is required"));
        }
        if request.topic.trim().is_empty() {
            return Err(Error::validation("topic is required"));
        }

        let references: Vec<String> = request
            .reference_images
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        let record = CompositeRecordDbModel::new(
            request.user_id,
            request.topic.trim(),
            request.outline.trim(),
            request.model_id.trim(),
            &references,
        )?;

        let pages: Vec<PageTaskDbModel> = normalize_pages(request.pages)
            .into_iter()
            .enumerate()
            .map(|(i, draft)| {
                PageTaskDbModel::new(&record.id, i as i64, draft.page_type, draft.content)
            })
            .collect();

        self.repo.create_record(&record, &pages).await?;
        info!(record_id = %record.id, pages = pages.len(), "Record created");
        Ok(record)
    }

    /// Admit the user, then reset every page for a fresh generation round.
    pub async fn start_generation(
        &self,
        ctx: &WaitContext,
        keep_alive: Option<&mut dyn KeepAlive>,
        user_id: i64,
        record_id: &str,
    ) -> Result<u64> {
        let record = self.owned_record(user_id, record_id).await?;
        self.admission
            .await_slot(user_id, &record.model_id, ctx, keep_alive)
            .await?;

        let pages = self.repo.start_generation(record_id).await?;
        info!(record_id, pages, "Record generation started");
        Ok(pages)
    }

    /// Requeue the given failed pages. Pages in any other state are skipped.
    pub async fn retry_pages(
        &self,
        user_id: i64,
        record_id: &str,
        page_ids: &[String],
    ) -> Result<u64> {
        if page_ids.is_empty() {
            return Err(Error::validation("no pages selected"));
        }
        self.owned_record(user_id, record_id).await?;

        let reset = self.repo.reset_failed_pages(record_id, page_ids).await?;
        info!(record_id, reset, "Failed pages requeued");
        Ok(reset)
    }

    pub async fn get_record(&self, user_id: i64, record_id: &str) -> Result<RecordView> {
        let record = self.owned_record(user_id, record_id).await?;
        let pages = self.repo.list_pages(record_id).await?;
        let counts = self.repo.page_status_counts(record_id).await?;
        Ok(RecordView {
            record,
            pages,
            counts,
        })
    }

    pub async fn list_records(
        &self,
        user_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<CompositeRecordDbModel>> {
        self.repo.list_records(user_id, limit, offset).await
    }

    /// Tombstone a record and its pages.
    pub async fn delete_record(&self, user_id: i64, record_id: &str) -> Result<()> {
        if self.repo.mark_record_deleted(user_id, record_id).await? {
            Ok(())
        } else {
            Err(Error::not_found("CompositeRecord", record_id))
        }
    }

    /// Another user's record is reported as missing.
    async fn owned_record(&self, user_id: i64, record_id: &str) -> Result<CompositeRecordDbModel> {
        let record = self.repo.get_record(record_id).await?;
        if record.user_id != user_id {
            return Err(Error::not_found("CompositeRecord", record_id));
        }
        Ok(record)
    }
}
