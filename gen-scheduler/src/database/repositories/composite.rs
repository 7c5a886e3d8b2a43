//! Composite record and page task repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    Claim, CompositeRecordDbModel, PageStatusCounts, PageTaskDbModel, PageType, RecordStatus,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{begin_immediate, time::now_ms};
use crate::{Error, Result};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

/// Claims the next due page of a generating record.
///
/// Records are served oldest first, pages in index order. A non-cover page only
/// becomes eligible once the record has a cover image, or once no cover page
/// of the record is still waiting or in flight (a cover that failed for good
/// must not block the rest of the record forever).
const CLAIM_PAGE_SQL: &str = r#"
    UPDATE page_task
    SET status = 'RUNNING',
        attempts = attempts + 1,
        last_error = NULL,
        next_attempt_at = NULL,
        updated_at = ?1
    WHERE id = (
        SELECT p.id
        FROM page_task p
        JOIN composite_record r ON r.id = p.record_id
        WHERE p.status = 'PENDING'
          AND p.deleted_at IS NULL
          AND r.deleted_at IS NULL
          AND r.status IN ('GENERATING', 'PARTIAL')
          AND (p.next_attempt_at IS NULL OR p.next_attempt_at <= ?1)
          AND (
                p.page_type = 'COVER'
             OR r.cover_url IS NOT NULL
             OR NOT EXISTS (
                    SELECT 1 FROM page_task c
                    WHERE c.record_id = p.record_id
                      AND c.page_type = 'COVER'
                      AND c.deleted_at IS NULL
                      AND c.status IN ('PENDING', 'RUNNING')
                )
          )
        ORDER BY r.created_at ASC, r.rowid ASC, p.page_index ASC
        LIMIT 1
    )
    RETURNING *
"#;

const PAGE_COUNTS_SQL: &str = r#"
    SELECT
        COUNT(*) AS total,
        COALESCE(SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), 0) AS pending,
        COALESCE(SUM(CASE WHEN status = 'RUNNING' THEN 1 ELSE 0 END), 0) AS running,
        COALESCE(SUM(CASE WHEN status = 'SUCCEEDED' THEN 1 ELSE 0 END), 0) AS succeeded,
        COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed
    FROM page_task
    WHERE record_id = ? AND deleted_at IS NULL
"#;

/// Composite record repository trait.
#[async_trait]
pub trait CompositeRepository: Send + Sync {
    /// Insert a record together with its pages.
    async fn create_record(
        &self,
        record: &CompositeRecordDbModel,
        pages: &[PageTaskDbModel],
    ) -> Result<()>;
    /// Fetch a live (not tombstoned) record.
    async fn get_record(&self, id: &str) -> Result<CompositeRecordDbModel>;
    async fn list_records(
        &self,
        user_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<CompositeRecordDbModel>>;
    async fn list_pages(&self, record_id: &str) -> Result<Vec<PageTaskDbModel>>;
    async fn get_page(&self, id: &str) -> Result<PageTaskDbModel>;
    /// Tombstone a record and its pages.
    async fn mark_record_deleted(&self, user_id: i64, id: &str) -> Result<bool>;

    /// Reset every page for (re)generation and move the record to GENERATING.
    async fn start_generation(&self, record_id: &str) -> Result<u64>;
    /// Reset the given failed pages and move the record back to GENERATING.
    async fn reset_failed_pages(&self, record_id: &str, page_ids: &[String]) -> Result<u64>;
    /// Count the record's pages and store the status they imply, in one
    /// immediate transaction.
    async fn recompute_record_status(
        &self,
        record_id: &str,
    ) -> Result<(PageStatusCounts, RecordStatus)>;
    async fn page_status_counts(&self, record_id: &str) -> Result<PageStatusCounts>;

    /// Atomically claim the next eligible page.
    async fn claim_next_page(&self, now_ms: i64) -> Result<Option<PageTaskDbModel>>;
    /// Mark a page succeeded; a cover page also publishes the record's cover
    /// image when none is set.
    async fn complete_page(&self, claim: &Claim, media_url: &str) -> Result<bool>;
    async fn fail_page(&self, claim: &Claim, message: &str) -> Result<bool>;
    async fn schedule_page_retry(
        &self,
        claim: &Claim,
        next_attempt_at: i64,
        message: &str,
    ) -> Result<bool>;
    /// Requeue pages left running since before `cutoff_ms`.
    async fn reset_stale_running(&self, cutoff_ms: i64) -> Result<u64>;
}

/// SQLx implementation of CompositeRepository.
pub struct SqlxCompositeRepository {
    pool: SqlitePool,
}

impl SqlxCompositeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CompositeRepository for SqlxCompositeRepository {
    async fn create_record(
        &self,
        record: &CompositeRecordDbModel,
        pages: &[PageTaskDbModel],
    ) -> Result<()> {
        let mut tx = begin_immediate(&self.pool).await?;

        sqlx::query(
            r#"
            INSERT INTO composite_record (
                id, user_id, topic, outline, model_id, reference_images, cover_url,
                status, created_at, updated_at, deleted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.user_id)
        .bind(&record.topic)
        .bind(&record.outline)
        .bind(&record.model_id)
        .bind(&record.reference_images)
        .bind(&record.cover_url)
        .bind(&record.status)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.deleted_at)
        .execute(&mut *tx)
        .await?;

        for page in pages {
            sqlx::query(
                r#"
                INSERT INTO page_task (
                    id, record_id, page_index, page_type, content, status, attempts,
                    attempt_base, next_attempt_at, last_error, error_message, media_url,
                    created_at, updated_at, completed_at, deleted_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&page.id)
            .bind(&record.id)
            .bind(page.page_index)
            .bind(&page.page_type)
            .bind(&page.content)
            .bind(&page.status)
            .bind(page.attempts)
            .bind(page.attempt_base)
            .bind(page.next_attempt_at)
            .bind(&page.last_error)
            .bind(&page.error_message)
            .bind(&page.media_url)
            .bind(page.created_at)
            .bind(page.updated_at)
            .bind(page.completed_at)
            .bind(page.deleted_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<CompositeRecordDbModel> {
        sqlx::query_as::<_, CompositeRecordDbModel>(
            "SELECT * FROM composite_record WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("CompositeRecord", id))
    }

    async fn list_records(
        &self,
        user_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<CompositeRecordDbModel>> {
        let records = sqlx::query_as::<_, CompositeRecordDbModel>(
            r#"
            SELECT * FROM composite_record
            WHERE user_id = ? AND deleted_at IS NULL
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT))
        .bind(offset.unwrap_or(0).max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list_pages(&self, record_id: &str) -> Result<Vec<PageTaskDbModel>> {
        let pages = sqlx::query_as::<_, PageTaskDbModel>(
            r#"
            SELECT * FROM page_task
            WHERE record_id = ? AND deleted_at IS NULL
            ORDER BY page_index ASC
            "#,
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(pages)
    }

    async fn get_page(&self, id: &str) -> Result<PageTaskDbModel> {
        sqlx::query_as::<_, PageTaskDbModel>(
            "SELECT * FROM page_task WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("PageTask", id))
    }

    async fn mark_record_deleted(&self, user_id: i64, id: &str) -> Result<bool> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.pool).await?;

        let result = sqlx::query(
            r#"
            UPDATE composite_record SET deleted_at = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE page_task SET deleted_at = ?, updated_at = ? WHERE record_id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn start_generation(&self, record_id: &str) -> Result<u64> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.pool).await?;

        let record = sqlx::query(
            r#"
            UPDATE composite_record
            SET status = 'GENERATING', cover_url = NULL, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(record_id)
        .execute(&mut *tx)
        .await?;

        if record.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::not_found("CompositeRecord", record_id));
        }

        let pages = sqlx::query(
            r#"
            UPDATE page_task
            SET status = 'PENDING',
                attempt_base = attempts,
                media_url = NULL,
                error_message = NULL,
                last_error = NULL,
                next_attempt_at = NULL,
                completed_at = NULL,
                updated_at = ?
            WHERE record_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(record_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(pages.rows_affected())
    }

    async fn reset_failed_pages(&self, record_id: &str, page_ids: &[String]) -> Result<u64> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.pool).await?;
        let mut reset = 0u64;

        for page_id in page_ids {
            let result = sqlx::query(
                r#"
                UPDATE page_task
                SET status = 'PENDING',
                    attempt_base = attempts,
                    error_message = NULL,
                    last_error = NULL,
                    next_attempt_at = NULL,
                    completed_at = NULL,
                    updated_at = ?
                WHERE id = ? AND record_id = ? AND status = 'FAILED' AND deleted_at IS NULL
                "#,
            )
            .bind(now)
            .bind(page_id)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
            reset += result.rows_affected();
        }

        if reset > 0 {
            sqlx::query(
                "UPDATE composite_record SET status = 'GENERATING', updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reset)
    }

    async fn recompute_record_status(
        &self,
        record_id: &str,
    ) -> Result<(PageStatusCounts, RecordStatus)> {
        let pool = &self.pool;

        retry_on_sqlite_busy("recompute_record_status", || async move {
            let mut tx = begin_immediate(pool).await?;
            let counts = sqlx::query_as::<_, PageStatusCounts>(PAGE_COUNTS_SQL)
                .bind(record_id)
                .fetch_one(&mut *tx)
                .await?;
            let status = counts.record_status();
            sqlx::query(
                "UPDATE composite_record SET status = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(status.as_str())
            .bind(now_ms())
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok::<_, Error>((counts, status))
        })
        .await
    }

    async fn page_status_counts(&self, record_id: &str) -> Result<PageStatusCounts> {
        let counts = sqlx::query_as::<_, PageStatusCounts>(PAGE_COUNTS_SQL)
            .bind(record_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(counts)
    }

    async fn claim_next_page(&self, now_ms: i64) -> Result<Option<PageTaskDbModel>> {
        let pool = &self.pool;

        retry_on_sqlite_busy("claim_next_page", || async move {
            let mut tx = begin_immediate(pool).await?;
            let claimed = sqlx::query_as::<_, PageTaskDbModel>(CLAIM_PAGE_SQL)
                .bind(now_ms)
                .fetch_optional(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, Error>(claimed)
        })
        .await
    }

    async fn complete_page(&self, claim: &Claim, media_url: &str) -> Result<bool> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.pool).await?;

        let completed: Option<(String, String)> = sqlx::query_as(
            r#"
            UPDATE page_task
            SET status = 'SUCCEEDED',
                media_url = ?,
                last_error = NULL,
                error_message = NULL,
                next_attempt_at = NULL,
                completed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND attempts = ?
            RETURNING record_id, page_type
            "#,
        )
        .bind(media_url)
        .bind(now)
        .bind(now)
        .bind(&claim.id)
        .bind(claim.attempts)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((record_id, page_type)) = completed else {
            tx.rollback().await?;
            return Ok(false);
        };

        // Publishing the cover in the same transaction keeps content pages from
        // being claimed before the cover reference exists.
        if page_type == PageType::Cover.as_str() {
            sqlx::query(
                r#"
                UPDATE composite_record SET cover_url = ?, updated_at = ?
                WHERE id = ? AND (cover_url IS NULL OR cover_url = '')
                "#,
            )
            .bind(media_url)
            .bind(now)
            .bind(&record_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn fail_page(&self, claim: &Claim, message: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE page_task
            SET status = 'FAILED',
                media_url = NULL,
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

    async fn schedule_page_retry(
        &self,
        claim: &Claim,
        next_attempt_at: i64,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE page_task
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

    async fn reset_stale_running(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE page_task
            SET status = 'PENDING',
                error_message = NULL,
                last_error = NULL,
                next_attempt_at = NULL,
                updated_at = ?
            WHERE status = 'RUNNING'
              AND updated_at < ?
              AND deleted_at IS NULL
            "#,
        )
        .bind(now_ms())
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
