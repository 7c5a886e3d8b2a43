//! Retry helpers for database operations.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 12;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

/// SQLite result codes 5 (SQLITE_BUSY) and 6 (SQLITE_LOCKED), or their messages.
fn is_sqlite_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let message = match sqlx_err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(Cow::into_owned);
            if matches!(code.as_deref(), Some("5") | Some("6")) {
                return true;
            }
            db_err.message().to_ascii_lowercase()
        }
        other => other.to_string().to_ascii_lowercase(),
    };

    message.contains("database is locked") || message.contains("database is busy")
}

/// Delay before retry number `attempt` (0-based): doubling from the base, capped,
/// plus up to 25% jitter, never above the cap.
fn busy_delay(attempt: u32) -> Duration {
    let exp = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(BUSY_MAX_DELAY_MS);
    let jitter = (capped as f64 * 0.25 * rand::random::<f64>()) as u64;
    Duration::from_millis((capped + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Run `op` again while it fails with a busy/locked error.
///
/// Claims and rate-limit acquisitions open `BEGIN IMMEDIATE` transactions, which
/// can still fail fast with SQLITE_BUSY once the busy timeout has elapsed.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = busy_delay(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = BUSY_MAX_RETRIES,
                    "SQLite busy, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
