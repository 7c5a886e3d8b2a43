//! SQLite-backed sliding-window store.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::time::Duration;

use crate::admission::{Decision, RateLimitStore, retry_after};
use crate::database::begin_immediate;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Rate-limit store over the `rate_limit_hit` table.
///
/// The purge, count and insert for one key run inside a single
/// `BEGIN IMMEDIATE` transaction, so concurrent acquirers are serialized on the
/// write lock and can never both observe a free slot. The purge covers every
/// key, so hits of idle users do not pile up.
pub struct SqliteRateLimitStore {
    pool: SqlitePool,
}

impl SqliteRateLimitStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> Result<Decision> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);
        let pool = &self.pool;

        retry_on_sqlite_busy("rate_limit_acquire", || async move {
            let mut tx = begin_immediate(pool).await?;

            sqlx::query("DELETE FROM rate_limit_hit WHERE hit_at <= ?")
                .bind(cutoff)
                .execute(&mut *tx)
                .await?;

            let (count, oldest): (i64, Option<i64>) = sqlx::query_as(
                "SELECT COUNT(*), MIN(hit_at) FROM rate_limit_hit WHERE limit_key = ?",
            )
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

            let decision = if count < i64::from(limit) {
                sqlx::query("INSERT INTO rate_limit_hit (limit_key, hit_at) VALUES (?, ?)")
                    .bind(key)
                    .bind(now_ms)
                    .execute(&mut *tx)
                    .await?;
                Decision::Granted
            } else {
                Decision::Denied {
                    retry_after: retry_after(window, now_ms, oldest.unwrap_or(now_ms)),
                }
            };

            tx.commit().await?;
            Ok::<_, Error>(decision)
        })
        .await
    }
}
