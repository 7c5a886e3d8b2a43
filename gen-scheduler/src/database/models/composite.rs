//! Composite record and page task database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{Claim, TaskStatus};
use crate::database::time::now_ms;

/// A multi-page illustrated record. Its status is derived from its pages.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CompositeRecordDbModel {
    pub id: String,
    pub user_id: i64,
    pub topic: String,
    pub outline: String,
    pub model_id: String,
    /// JSON array of user-supplied reference image URLs.
    pub reference_images: String,
    /// Image produced for the cover page; unlocks the remaining pages.
    pub cover_url: Option<String>,
    /// DRAFT, GENERATING, PARTIAL, COMPLETED, ERROR
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl CompositeRecordDbModel {
    pub fn new(
        user_id: i64,
        topic: impl Into<String>,
        outline: impl Into<String>,
        model_id: impl Into<String>,
        reference_images: &[String],
    ) -> crate::Result<Self> {
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            topic: topic.into(),
            outline: outline.into(),
            model_id: model_id.into(),
            reference_images: serde_json::to_string(reference_images)?,
            cover_url: None,
            status: RecordStatus::Draft.as_str().to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn status(&self) -> Option<RecordStatus> {
        RecordStatus::parse(&self.status)
    }

    pub fn reference_images(&self) -> Vec<String> {
        serde_json::from_str(&self.reference_images).unwrap_or_default()
    }
}

/// One page of a composite record, scheduled like any other task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PageTaskDbModel {
    pub id: String,
    pub record_id: String,
    pub page_index: i64,
    /// COVER, CONTENT, SUMMARY
    pub page_type: String,
    pub content: String,
    pub status: String,
    /// Total claims over the page's lifetime, never reset.
    pub attempts: i64,
    /// Value of `attempts` when the page was last reset for regeneration.
    pub attempt_base: i64,
    pub next_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub error_message: Option<String>,
    pub media_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl PageTaskDbModel {
    pub fn new(
        record_id: impl Into<String>,
        page_index: i64,
        page_type: PageType,
        content: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            record_id: record_id.into(),
            page_index,
            page_type: page_type.as_str().to_string(),
            content: content.into(),
            status: TaskStatus::Pending.as_str().to_string(),
            attempts: 0,
            attempt_base: 0,
            next_attempt_at: None,
            last_error: None,
            error_message: None,
            media_url: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            deleted_at: None,
        }
    }

    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::parse(&self.page_type)
    }

    pub fn is_cover(&self) -> bool {
        self.page_type() == Some(PageType::Cover)
    }

    pub fn claim(&self) -> Claim {
        Claim::new(self.id.clone(), self.attempts)
    }

    /// Claims since the last regeneration reset; this is what the retry
    /// ceiling and backoff ladder see.
    pub fn attempts_in_round(&self) -> i64 {
        self.attempts - self.attempt_base
    }
}

/// Page role within a composite record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageType {
    Cover,
    Content,
    Summary,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cover => "COVER",
            Self::Content => "CONTENT",
            Self::Summary => "SUMMARY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COVER" => Some(Self::Cover),
            "CONTENT" => Some(Self::Content),
            "SUMMARY" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// Derived status of a composite record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Pages exist but generation has not been started.
    Draft,
    Generating,
    /// Some pages failed, the rest succeeded or are still in flight.
    Partial,
    Completed,
    /// Every attempted page failed.
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Generating => "GENERATING",
            Self::Partial => "PARTIAL",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "GENERATING" => Some(Self::Generating),
            "PARTIAL" => Some(Self::Partial),
            "COMPLETED" => Some(Self::Completed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Per-record page counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PageStatusCounts {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl PageStatusCounts {
    /// Record status implied by these counts.
    ///
    /// A record with no pages stays GENERATING.
    pub fn record_status(&self) -> RecordStatus {
        if self.total > 0 && self.succeeded == self.total {
            return RecordStatus::Completed;
        }
        if self.total > 0 && self.pending == 0 && self.running == 0 {
            return if self.failed > 0 && self.succeeded == 0 {
                RecordStatus::Error
            } else {
                RecordStatus::Partial
            };
        }
        if self.failed > 0 {
            RecordStatus::Partial
        } else {
            RecordStatus::Generating
        }
    }
}

/// A page as supplied by the caller when creating a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDraft {
    pub page_type: PageType,
    pub content: String,
}

impl PageDraft {
    pub fn new(page_type: PageType, content: impl Into<String>) -> Self {
        Self {
            page_type,
            content: content.into(),
        }
    }
}
