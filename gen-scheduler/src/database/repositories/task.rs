//! Generation task repository (image and video rows).

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{Claim, GenerationTaskDbModel, TaskFilter, TaskKind};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{begin_immediate, time::now_ms};
use crate::{Error, Result};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

/// Claims the oldest due pending row of one kind.
const CLAIM_PENDING_SQL: &str = r#"
    UPDATE generation_task
    SET status = 'RUNNING',
        attempts = attempts + 1,
        last_error = NULL,
        next_attempt_at = NULL,
        updated_at = ?1
    WHERE id = (
        SELECT id FROM generation_task
        WHERE kind = ?2
          AND deleted_at IS NULL
          AND status = 'PENDING'
          AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
        ORDER BY created_at ASC, rowid ASC
        LIMIT 1
    )
    RETURNING *
"#;

/// Same as [`CLAIM_PENDING_SQL`], but parked rows (running with a provider job
/// id and a due poll time) are eligible too.
const CLAIM_PENDING_OR_PARKED_SQL: &str = r#"
    UPDATE generation_task
    SET status = 'RUNNING',
        attempts = attempts + 1,
        last_error = NULL,
        next_attempt_at = NULL,
        updated_at = ?1
    WHERE id = (
        SELECT id FROM generation_task
        WHERE kind = ?2
          AND deleted_at IS NULL
          AND (
                (status = 'PENDING' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1))
             OR (status = 'RUNNING' AND external_id IS NOT NULL
                 AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?1)
          )
        ORDER BY created_at ASC, rowid ASC
        LIMIT 1
    )
    RETURNING *
"#;

/// Generation task repository trait.
///
/// Every write that follows a claim is fenced on the [`Claim`] and reports
/// whether a row was actually transitioned.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, task: &GenerationTaskDbModel) -> Result<()>;
    /// Fetch a live (not tombstoned) task.
    async fn get_task(&self, id: &str) -> Result<GenerationTaskDbModel>;
    async fn list_tasks(
        &self,
        user_id: i64,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTaskDbModel>>;
    /// Tombstone a task owned by `user_id`.
    async fn mark_deleted(&self, user_id: i64, id: &str) -> Result<bool>;

    /// Atomically claim the next eligible task of `kind`.
    async fn claim_next(&self, kind: TaskKind, now_ms: i64)
    -> Result<Option<GenerationTaskDbModel>>;
    async fn complete(&self, claim: &Claim, media_urls: &[String]) -> Result<bool>;
    async fn fail(&self, claim: &Claim, message: &str) -> Result<bool>;
    async fn schedule_retry(&self, claim: &Claim, next_attempt_at: i64, message: &str)
    -> Result<bool>;
    /// Keep a submitted video task running until its next provider poll.
    async fn park(&self, claim: &Claim, external_id: &str, next_attempt_at: i64) -> Result<bool>;

    /// Requeue rows of `kind` left running since before `cutoff_ms`.
    async fn reset_stale_running(&self, kind: TaskKind, cutoff_ms: i64) -> Result<u64>;
}

/// SQLx implementation of TaskRepository.
pub struct SqlxTaskRepository {
    pool: SqlitePool,
}

impl SqlxTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn create_task(&self, task: &GenerationTaskDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO generation_task (
                id, kind, user_id, model_id, prompt, params, status, attempts,
                next_attempt_at, last_error, error_message, media_urls, external_id,
                created_at, updated_at, completed_at, deleted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.kind)
        .bind(task.user_id)
        .bind(&task.model_id)
        .bind(&task.prompt)
        .bind(&task.params)
        .bind(&task.status)
        .bind(task.attempts)
        .bind(task.next_attempt_at)
        .bind(&task.last_error)
        .bind(&task.error_message)
        .bind(&task.media_urls)
        .bind(&task.external_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .bind(task.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<GenerationTaskDbModel> {
        sqlx::query_as::<_, GenerationTaskDbModel>(
            "SELECT * FROM generation_task WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("GenerationTask", id))
    }

    async fn list_tasks(
        &self,
        user_id: i64,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTaskDbModel>> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0).max(0);

        let tasks = sqlx::query_as::<_, GenerationTaskDbModel>(
            r#"
            SELECT * FROM generation_task
            WHERE user_id = ?1
              AND deleted_at IS NULL
              AND (?2 IS NULL OR kind = ?2)
              AND (?3 IS NULL OR status = ?3)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?4 OFFSET ?5
            "#,
        )
        .bind(user_id)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn mark_deleted(&self, user_id: i64, id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE generation_task SET deleted_at = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_next(
        &self,
        kind: TaskKind,
        now_ms: i64,
    ) -> Result<Option<GenerationTaskDbModel>> {
        let sql = match kind {
            TaskKind::Video => CLAIM_PENDING_OR_PARKED_SQL,
            TaskKind::Image => CLAIM_PENDING_SQL,
            TaskKind::Page => {
                return Err(Error::validation(
                    "page tasks are claimed through the composite repository",
                ));
            }
        };
        let pool = &self.pool;

        retry_on_sqlite_busy("claim_next_generation_task", || async move {
            let mut tx = begin_immediate(pool).await?;
            let claimed = sqlx::query_as::<_, GenerationTaskDbModel>(sql)
                .bind(now_ms)
                .bind(kind.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, Error>(claimed)
        })
        .await
    }

    async fn complete(&self, claim: &Claim, media_urls: &[String]) -> Result<bool> {
        let now = now_ms();
        let media = serde_json::to_string(media_urls)?;
        let result = sqlx::query(
            r#"
            UPDATE generation_task
            SET status = 'SUCCEEDED',
                media_urls = ?,
                last_error = NULL,
                error_message = NULL,
                next_attempt_at = NULL,
                completed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND attempts = ?
            "#,
        )
        .bind(media)
        .bind(now)
        .bind(now)
        .bind(&claim.id)
        .bind(claim.attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(&self, claim: &Claim, message: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE generation_task
            SET status = 'FAILED',
                media_urls = NULL,
                error_message = ?,
                last_error = ?,
                next_attempt_at = NULL,
                completed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND attempts = ?
            "#,
        )
        .bind(message)
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(&claim.id)
        .bind(claim.attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(
        &self,
        claim: &Claim,
        next_attempt_at: i64,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE generation_task
            SET status = 'PENDING',
                next_attempt_at = ?,
                last_error = ?,
                updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND attempts = ?
            "#,
        )
        .bind(next_attempt_at)
        .bind(message)
        .bind(now_ms())
        .bind(&claim.id)
        .bind(claim.attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn park(&self, claim: &Claim, external_id: &str, next_attempt_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE generation_task
            SET external_id = ?,
                next_attempt_at = ?,
                last_error = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND attempts = ?
            "#,
        )
        .bind(external_id)
        .bind(next_attempt_at)
        .bind(now_ms())
        .bind(&claim.id)
        .bind(claim.attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_stale_running(&self, kind: TaskKind, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE generation_task
            SET status = 'PENDING',
                error_message = NULL,
                last_error = NULL,
                next_attempt_at = NULL,
                updated_at = ?
            WHERE kind = ?
              AND status = 'RUNNING'
              AND updated_at < ?
              AND deleted_at IS NULL
            "#,
        )
        .bind(now_ms())
        .bind(kind.as_str())
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{TaskParams, TaskStatus};
    use crate::database::{init_pool, run_migrations};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlxTaskRepository) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.db");
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy().replace('\\', "/"));
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, SqlxTaskRepository::new(pool))
    }

    async fn insert(repo: &SqlxTaskRepository, kind: TaskKind, created_at: i64) -> String {
        let mut task =
            GenerationTaskDbModel::new(kind, 1, "model-a", "prompt", &TaskParams::default())
                .unwrap();
        task.created_at = created_at;
        task.updated_at = created_at;
        repo.create_task(&task).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_claim_oldest_first_and_increments_attempts() {
        let (_dir, repo) = setup().await;
        let newer = insert(&repo, TaskKind::Image, 2_000).await;
        let older = insert(&repo, TaskKind::Image, 1_000).await;

        let first = repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().unwrap();
        assert_eq!(first.id, older);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.status(), Some(TaskStatus::Running));

        let second = repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().unwrap();
        assert_eq!(second.id, newer);

        assert!(repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_kind_and_next_attempt_at() {
        let (_dir, repo) = setup().await;
        insert(&repo, TaskKind::Video, 1_000).await;
        let image = insert(&repo, TaskKind::Image, 2_000).await;

        let claimed = repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().unwrap();
        assert_eq!(claimed.id, image);

        let future = now_ms() + 60_000;
        assert!(
            repo.schedule_retry(&claimed.claim(), future, "timeout")
                .await
                .unwrap()
        );
        assert!(repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().is_none());
        let later = repo.claim_next(TaskKind::Image, future).await.unwrap().unwrap();
        assert_eq!(later.id, image);
        assert_eq!(later.attempts, 2);
        assert!(later.last_error.is_none());
    }

    #[tokio::test]
    async fn test_tombstoned_tasks_are_hidden() {
        let (_dir, repo) = setup().await;
        let id = insert(&repo, TaskKind::Image, 1_000).await;

        assert!(!repo.mark_deleted(2, &id).await.unwrap());
        assert!(repo.mark_deleted(1, &id).await.unwrap());

        assert!(matches!(
            repo.get_task(&id).await,
            Err(Error::NotFound { .. })
        ));
        assert!(
            repo.list_tasks(1, &TaskFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
        assert!(repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_is_fenced_and_idempotent() {
        let (_dir, repo) = setup().await;
        insert(&repo, TaskKind::Image, 1_000).await;
        let claimed = repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().unwrap();
        let media = vec!["https://cdn/a.png".to_string()];

        assert!(repo.complete(&claimed.claim(), &media).await.unwrap());
        assert!(!repo.complete(&claimed.claim(), &media).await.unwrap());
        assert!(!repo.fail(&claimed.claim(), "late").await.unwrap());

        let task = repo.get_task(&claimed.id).await.unwrap();
        assert_eq!(task.status(), Some(TaskStatus::Succeeded));
        assert_eq!(task.media(), media);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_reset_and_superseded_claim() {
        let (_dir, repo) = setup().await;
        insert(&repo, TaskKind::Image, 1_000).await;
        let first = repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().unwrap();

        // Nothing is older than a cutoff in the past.
        assert_eq!(repo.reset_stale_running(TaskKind::Image, 0).await.unwrap(), 0);
        // Other kinds are untouched.
        assert_eq!(
            repo.reset_stale_running(TaskKind::Video, now_ms() + 1)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            repo.reset_stale_running(TaskKind::Image, now_ms() + 1)
                .await
                .unwrap(),
            1
        );

        let second = repo.claim_next(TaskKind::Image, now_ms()).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);

        // The superseded worker cannot write its outcome.
        assert!(!repo.complete(&first.claim(), &[]).await.unwrap());
        assert!(repo.fail(&second.claim(), "boom").await.unwrap());
    }

    #[tokio::test]
    async fn test_parked_video_is_reclaimed_when_due() {
        let (_dir, repo) = setup().await;
        insert(&repo, TaskKind::Video, 1_000).await;
        let claimed = repo.claim_next(TaskKind::Video, now_ms()).await.unwrap().unwrap();
        let due = now_ms() + 12_000;
        assert!(repo.park(&claimed.claim(), "vid_1", due).await.unwrap());

        assert!(repo.claim_next(TaskKind::Video, now_ms()).await.unwrap().is_none());
        let polled = repo.claim_next(TaskKind::Video, due).await.unwrap().unwrap();
        assert_eq!(polled.external_id.as_deref(), Some("vid_1"));
        assert_eq!(polled.attempts, 2);
        // A running row without a provider id is never reclaimed.
        assert!(repo.claim_next(TaskKind::Video, due + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (_dir, repo) = setup().await;
        insert(&repo, TaskKind::Image, 1_000).await;
        insert(&repo, TaskKind::Video, 2_000).await;

        let videos = repo
            .list_tasks(
                1,
                &TaskFilter {
                    kind: Some(TaskKind::Video),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(videos.len(), 1);

        let all = repo.list_tasks(1, &TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].created_at >= all[1].created_at);
    }
}
