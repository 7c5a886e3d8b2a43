//! Image and video task submission.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::admission::{AdmissionController, KeepAlive, WaitContext};
use crate::database::models::{GenerationTaskDbModel, TaskFilter, TaskKind, TaskParams};
use crate::database::repositories::TaskRepository;
use crate::{Error, Result};

/// A caller's generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: i64,
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub params: TaskParams,
}

impl NewTask {
    pub fn new(user_id: i64, model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            user_id,
            model_id: model_id.into(),
            prompt: prompt.into(),
            params: TaskParams::default(),
        }
    }

    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.user_id <= 0 {
            return Err(Error::validation("invalid user id"));
        }
        if self.model_id.trim().is_empty() {
            return Err(Error::validation("model is required"));
        }
        if self.prompt.trim().is_empty() {
            return Err(Error::validation("prompt is required"));
        }
        Ok(())
    }
}

/// Entry point for single image and video tasks.
pub struct TaskService {
    repo: Arc<dyn TaskRepository>,
    admission: Arc<AdmissionController>,
}

impl TaskService {
    pub fn new(repo: Arc<dyn TaskRepository>, admission: Arc<AdmissionController>) -> Self {
        Self { repo, admission }
    }

    /// Admit and enqueue an image task.
    pub async fn submit_image(
        &self,
        ctx: &WaitContext,
        keep_alive: Option<&mut dyn KeepAlive>,
        request: NewTask,
    ) -> Result<GenerationTaskDbModel> {
        self.submit(TaskKind::Image, ctx, keep_alive, request).await
    }

    /// Admit and enqueue a video task.
    pub async fn submit_video(
        &self,
        ctx: &WaitContext,
        keep_alive: Option<&mut dyn KeepAlive>,
        request: NewTask,
    ) -> Result<GenerationTaskDbModel> {
        self.submit(TaskKind::Video, ctx, keep_alive, request).await
    }

    async fn submit(
        &self,
        kind: TaskKind,
        ctx: &WaitContext,
        keep_alive: Option<&mut dyn KeepAlive>,
        request: NewTask,
    ) -> Result<GenerationTaskDbModel> {
        request.validate()?;
        let model = request.model_id.trim();

        self.admission
            .await_slot(request.user_id, model, ctx, keep_alive)
            .await?;

        let params = match kind {
            TaskKind::Image => request.params.normalized(),
            _ => request.params,
        };
        let task =
            GenerationTaskDbModel::new(kind, request.user_id, model, request.prompt.trim(), &params)?;
        self.repo.create_task(&task).await?;

        info!(
            kind = kind.label(),
            task_id = %task.id,
            user_id = task.user_id,
            model = %task.model_id,
            "Task submitted"
        );
        Ok(task)
    }

    /// Current snapshot of a task; tombstoned tasks are not found.
    pub async fn get_status(&self, task_id: &str) -> Result<GenerationTaskDbModel> {
        self.repo.get_task(task_id).await
    }

    /// A user's tasks, newest first.
    pub async fn list(&self, user_id: i64, filter: &TaskFilter) -> Result<Vec<GenerationTaskDbModel>> {
        self.repo.list_tasks(user_id, filter).await
    }

    /// Tombstone a task owned by `user_id`.
    pub async fn delete(&self, user_id: i64, task_id: &str) -> Result<()> {
        if self.repo.mark_deleted(user_id, task_id).await? {
            Ok(())
        } else {
            Err(Error::not_found("GenerationTask", task_id))
        }
    }
}
