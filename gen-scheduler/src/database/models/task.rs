//! Generation task database models (image and video).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Claim;
use crate::database::time::now_ms;

/// Smallest and largest number of images a single task may request.
pub const MIN_IMAGE_COUNT: u32 = 1;
pub const MAX_IMAGE_COUNT: u32 = 4;

/// A single image or video generation request and its lifecycle state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GenerationTaskDbModel {
    pub id: String,
    /// IMAGE or VIDEO
    pub kind: String,
    pub user_id: i64,
    pub model_id: String,
    pub prompt: String,
    /// JSON-encoded [`TaskParams`]
    pub params: String,
    /// PENDING, RUNNING, SUCCEEDED, FAILED
    pub status: String,
    /// Incremented on every claim, never reset.
    pub attempts: i64,
    /// Claim gate for scheduled retries and parked video polls.
    pub next_attempt_at: Option<i64>,
    /// Message from the most recent retryable failure.
    pub last_error: Option<String>,
    /// Message recorded on terminal failure.
    pub error_message: Option<String>,
    /// JSON array of result URLs.
    pub media_urls: Option<String>,
    /// Provider-side job id for asynchronous (video) generation.
    pub external_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl GenerationTaskDbModel {
    pub fn new(
        kind: TaskKind,
        user_id: i64,
        model_id: impl Into<String>,
        prompt: impl Into<String>,
        params: &TaskParams,
    ) -> crate::Result<Self> {
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.as_str().to_string(),
            user_id,
            model_id: model_id.into(),
            prompt: prompt.into(),
            params: serde_json::to_string(params)?,
            status: TaskStatus::Pending.as_str().to_string(),
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            error_message: None,
            media_urls: None,
            external_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            deleted_at: None,
        })
    }

    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn task_kind(&self) -> Option<TaskKind> {
        TaskKind::parse(&self.kind)
    }

    pub fn params(&self) -> crate::Result<TaskParams> {
        Ok(serde_json::from_str(&self.params)?)
    }

    /// Result URLs, empty until the task succeeds.
    pub fn media(&self) -> Vec<String> {
        self.media_urls
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn claim(&self) -> Claim {
        Claim::new(self.id.clone(), self.attempts)
    }
}

/// Provider-facing input parameters stored alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

fn default_count() -> u32 {
    MIN_IMAGE_COUNT
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            resolution: None,
            aspect_ratio: None,
            reference_image: None,
            count: default_count(),
            duration_secs: None,
            seed: None,
        }
    }
}

impl TaskParams {
    /// Clamp the requested image count into the supported range.
    pub fn normalized(mut self) -> Self {
        self.count = self.count.clamp(MIN_IMAGE_COUNT, MAX_IMAGE_COUNT);
        self
    }
}

/// Task kinds handled by the scheduler. Each kind has its own workers and never
/// touches another kind's rows.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Image,
    Video,
    /// A page of a composite record (stored in `page_task`).
    Page,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Image, TaskKind::Video, TaskKind::Page];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Page => "PAGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IMAGE" => Some(Self::Image),
            "VIDEO" => Some(Self::Video),
            "PAGE" => Some(Self::Page),
            _ => None,
        }
    }

    /// Lowercase label used in settings keys and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Page => "page",
        }
    }
}

/// Lifecycle status shared by generation tasks and page tasks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly gated by `next_attempt_at`).
    Pending,
    /// Claimed by exactly one worker.
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Filters for listing a user's generation tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = GenerationTaskDbModel::new(
            TaskKind::Image,
            7,
            "img-model",
            "a lighthouse",
            &TaskParams::default(),
        )
        .unwrap();
        assert_eq!(task.status(), Some(TaskStatus::Pending));
        assert_eq!(task.task_kind(), Some(TaskKind::Image));
        assert_eq!(task.attempts, 0);
        assert!(task.media().is_empty());
        assert_eq!(task.params().unwrap().count, 1);
    }

    #[test]
    fn test_status_parse() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(TaskStatus::parse("DONE"), None);
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_count_normalization() {
        let params = TaskParams {
            count: 0,
            ..Default::default()
        };
        assert_eq!(params.normalized().count, 1);

        let params = TaskParams {
            count: 9,
            ..Default::default()
        };
        assert_eq!(params.normalized().count, 4);
    }

    #[test]
    fn test_params_defaults_from_json() {
        let params: TaskParams = serde_json::from_str(r#"{"resolution":"1k"}"#).unwrap();
        assert_eq!(params.count, 1);
        assert_eq!(params.resolution.as_deref(), Some("1k"));
    }
}
